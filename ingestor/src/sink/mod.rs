mod file;
mod retry;

pub use file::FileSink;
pub use retry::RetryingSink;
