pub mod inflater;
pub mod join_tree;

pub use inflater::{InflationState, RelationFixer, RowCapture, RowInflater, RowView};
pub use join_tree::{JoinNode, JoinTree, NodeId, NodeRole};
