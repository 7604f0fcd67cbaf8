// This is free and unencumbered software released into the public domain.

//! Logging shims. With the `tracing` feature the macros forward to the
//! subscriber re-exported by `asimov-module`; without it they compile away.

#![allow(unused_macros)]

cfg_if::cfg_if! {
    if #[cfg(feature = "tracing")] {
        macro_rules! trace {
            ($($arg:tt)*) => {
                asimov_module::tracing::trace!(target: "asimov_capture_module", $($arg)*)
            };
        }

        macro_rules! debug {
            ($($arg:tt)*) => {
                asimov_module::tracing::debug!(target: "asimov_capture_module", $($arg)*)
            };
        }

        macro_rules! info {
            ($($arg:tt)*) => {
                asimov_module::tracing::info!(target: "asimov_capture_module", $($arg)*)
            };
        }

        macro_rules! warn {
            ($($arg:tt)*) => {
                asimov_module::tracing::warn!(target: "asimov_capture_module", $($arg)*)
            };
        }

        macro_rules! error {
            ($($arg:tt)*) => {
                asimov_module::tracing::error!(target: "asimov_capture_module", $($arg)*)
            };
        }
    } else {
        macro_rules! trace {
            ($($arg:tt)*) => {{}};
        }

        macro_rules! debug {
            ($($arg:tt)*) => {{}};
        }

        macro_rules! info {
            ($($arg:tt)*) => {{}};
        }

        macro_rules! warn {
            ($($arg:tt)*) => {{}};
        }

        macro_rules! error {
            ($($arg:tt)*) => {{}};
        }
    }
}
