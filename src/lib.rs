// 导出模块
pub mod pfcommon;
pub mod pfserver;
pub mod pfstream;

// Re-export error types
pub use pfcommon::error::AppError;
