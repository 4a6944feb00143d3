pub mod install;
pub mod replay;
pub mod uninstall;
