//! kennel-sysinfo-plugin: example kennel plugin
//!
//! Settings (`KENNEL_PLUGIN_CONFIG`):
//!
//! - `greeting`: returned by the `hello` action (default "Hello from Rust!")
//! - `echo_limit`: maximum characters returned by `echo` (default 4096)

mod sysinfo;

kennel_plugin_sdk::plugin_main!(sysinfo::SysinfoPlugin::new());
