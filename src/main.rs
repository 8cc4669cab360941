//! `wifi-scope` viewer entry point

fn main() -> anyhow::Result<()> {
    wifi_scope_lib::run()
}
