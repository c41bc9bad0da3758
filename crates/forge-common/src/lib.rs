// Shared pieces of the Forge build orchestrator: the framed wire protocol
// spoken between master and workers, build recipes with macro expansion,
// configuration surfaces and the common error kinds.

pub mod codec;
pub mod config;
pub mod error;
pub mod letter;
pub mod macros;
pub mod recipe;
