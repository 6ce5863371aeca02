//! Shared fixtures for the integration suites.

/// A service name that does not collide across test processes or
/// leftover registry entries from earlier runs.
pub fn unique_name(prefix: &str) -> String {
    format!(
        "{}-{}-{:08x}",
        prefix,
        std::process::id(),
        rand::random::<u32>()
    )
}

pub fn init_logger() {
    let _ = simple_logger::init_with_level(log::Level::Info);
}
