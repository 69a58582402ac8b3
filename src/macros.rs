#![allow(unused_macros)]

macro_rules! trace {
    ($($t:tt)*) => {
        log!(trace, $($t)*)
    }
}

macro_rules! debug {
    ($($t:tt)*) => {
        log!(debug, $($t)*)
    }
}

macro_rules! info {
    ($($t:tt)*) => {
        log!(info, $($t)*)
    }
}

macro_rules! warn {
    ($($t:tt)*) => {
        log!(warn, $($t)*)
    }
}

macro_rules! error {
    ($($t:tt)*) => {
        log!(error, $($t)*)
    }
}

macro_rules! log {
    ($level: ident, $($t:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::$level!($($t)*) }
        // Keep arguments type-checked without a subscriber.
        #[cfg(not(feature = "tracing"))]
        { if false { let _ = format!($($t)*); } }
    }}
}

/// Log an engine result code together with the call site that produced it.
macro_rules! oec_failure {
    ($level: ident, $site: expr, $code: expr) => {
        log!($level, "{}: engine returned {} ({})", $site, $code, $code.code())
    };
}

#[cfg(test)]
mod tests {
    use crate::oemcrypto::OemCryptoError;

    fn level_for(code: OemCryptoError) -> &'static str {
        match code {
            OemCryptoError::ShortBuffer => trace!("retrying with a larger buffer"),
            OemCryptoError::KeyExpired => warn!("key expired"),
            _ => error!("unexpected {}", code),
        }
        "logged"
    }

    #[test]
    fn log_macros_expand_to_expressions() {
        assert_eq!(level_for(OemCryptoError::ShortBuffer), "logged");
        assert_eq!(level_for(OemCryptoError::KeyExpired), "logged");
        let closure = |verbose: bool| {
            if verbose {
                debug!("value {}", 1)
            } else {
                oec_failure!(error, "Decrypt", OemCryptoError::UnknownFailure)
            }
        };
        closure(true);
        closure(false);
        assert_eq!(level_for(OemCryptoError::DecryptFailed), "logged");
    }
}
