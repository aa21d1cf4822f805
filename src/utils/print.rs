//! Helper macros for logging (console printing).

use env_logger::Env;

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!(self.server; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::trace!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_debug!(self.server; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::debug!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_info!(self.server; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::info!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_warn!(self.server; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::warn!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_error!(self.server; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::error!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return an `Err(RssError)`
/// containing the string. The variant defaults to `RssError::Msg` and can be
/// chosen explicitly with the `prefix => Variant;` form.
///
/// Example:
/// ```no_compile
/// let e = logged_err!(self.server; "got {} to print", msg);
/// let e = logged_err!("client" => UploadState; "not connected");
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr => $variant:ident; $($fmt_args:tt)*) => {
        {
            pf_error!($prefix; $($fmt_args)*);
            Err($crate::RssError::$variant(format!($($fmt_args)*)))
        }
    };

    ($prefix:expr; $($fmt_args:tt)*) => {
        {
            pf_error!($prefix; $($fmt_args)*);
            Err($crate::RssError::Msg(format!($($fmt_args)*)))
        }
    };
}

#[cfg(test)]
mod print_tests {
    use crate::utils::RssError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("t"; "interesting message"),
            Err::<(), RssError>(RssError::msg("interesting message"))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("t"; "got {} to print", 777),
            Err::<(), RssError>(RssError::msg("got 777 to print"))
        );
    }

    #[test]
    fn error_with_variant() {
        assert_eq!(
            logged_err!("t" => UploadState; "step {} out of order", 3),
            Err::<(), RssError>(RssError::upload_state("step 3 out of order"))
        );
    }
}
