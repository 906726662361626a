pub mod codec;
pub mod constants;
pub mod error;
pub mod flag;
