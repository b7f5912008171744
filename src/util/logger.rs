//! The built-in logger.
//!
//! The crate uses the [`log`] facade throughout.  With the default
//! `builtin_env_logger` cargo feature, the embedder can ask the runtime to
//! install an [`env_logger`] so that `RUST_LOG=trace` works out of the box;
//! without the feature this module is a no-op and the embedder brings its own
//! `log` implementation.

/// Attempt to initialise the built-in env_logger.  Does nothing if another
/// logger is already installed, or if the `builtin_env_logger` feature is
/// disabled.
pub fn try_init() {
    #[cfg(feature = "builtin_env_logger")]
    {
        let _ = env_logger::builder().is_test(false).try_init();
    }
}
