pub mod semantic;

pub use semantic::{SemanticMemory, TreeExport, TreeNode, ZoneSummary};
