pub mod hook;
pub mod serve;
