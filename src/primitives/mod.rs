pub mod flag;
pub mod lock;
