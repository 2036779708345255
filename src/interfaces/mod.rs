pub mod repl;
pub mod telegram;
pub mod transport;
