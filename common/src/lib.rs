pub mod shutdown;
pub mod wait;

/// Process-wide initialization: color override and the rustls crypto
/// provider. Call once from `main` before anything touches TLS.
pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);

    install_rustls_provider();
}

pub fn install_rustls_provider() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install aws-lc-rs provider");
}

/// Touch the readiness file probed by the container's readiness check.
pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub mod annotations {
    pub const CREATED_BY: &str = "audit.leastpriv.io/created-by";
    pub const SPEC_HASH: &str = "audit.leastpriv.io/spec-hash";
}
