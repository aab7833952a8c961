/// Constant storing the application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Section of the game module holding its code
pub const CODE_SECTION: &str = ".text";
