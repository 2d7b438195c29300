fn main() {
    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let built = chrono::Utc::now().format("%Y-%m-%d").to_string();

    let hash = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string());

    let long_version = match hash {
        Some(hash) => format!("{version} ({hash}, built {built})"),
        None => format!("{version} (built {built})"),
    };
    println!("cargo:rustc-env=MENDER_LONG_VERSION={long_version}");
    println!("cargo:rerun-if-changed=build.rs");
}
