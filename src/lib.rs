// 导出模块
pub mod klcommon;
pub mod klingest;

// Re-export error types
pub use klcommon::error::{AppError, Result};
