//! Classification of TLS trust failures.
//!
//! A failed handshake is sorted into one of a small set of categories so
//! user-visible errors say what is actually wrong with the server's
//! certificate instead of a generic handshake failure. The category
//! phrase appears verbatim in the error text; callers match on it.

use std::error::Error as StdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsTrustError {
    /// No chain to a trusted root
    UnknownAuthority,
    /// The server certificate is past its notAfter date
    Expired,
    /// The presented end-entity certificate is self-signed
    SelfSignedDepthZero,
    /// The end-entity key is below the accepted strength
    EndEntityKeyTooSmall,
    /// The certificate does not cover the requested host name
    HostMismatch,
    /// A handshake failure outside the categories above
    Other,
}

impl TlsTrustError {
    /// The canonical phrase for this category; stable, matched by callers.
    pub(crate) fn phrase(&self) -> &'static str {
        match self {
            Self::UnknownAuthority => "certificate signed by unknown authority",
            Self::Expired => "certificate has expired",
            Self::SelfSignedDepthZero => "self-signed certificate",
            Self::EndEntityKeyTooSmall => "certificate key is too small",
            Self::HostMismatch => "certificate is not valid for the requested host",
            Self::Other => "TLS handshake failure",
        }
    }

    /// Classify a single error message.
    pub(crate) fn classify_str(text: &str) -> Option<Self> {
        let t = text.to_ascii_lowercase();
        if t.contains("certificate has expired") || t.contains("certificate expired") {
            Some(Self::Expired)
        } else if t.contains("self-signed certificate in certificate chain")
            || t.contains("self signed certificate in certificate chain")
            || t.contains("unable to get local issuer certificate")
            || t.contains("unable to get issuer certificate")
            || t.contains("unknown authority")
        {
            Some(Self::UnknownAuthority)
        } else if t.contains("self-signed certificate") || t.contains("self signed certificate") {
            Some(Self::SelfSignedDepthZero)
        } else if t.contains("ee key too small") || t.contains("key too small") {
            Some(Self::EndEntityKeyTooSmall)
        } else if t.contains("hostname mismatch")
            || t.contains("no alternative certificate subject name matches")
            || t.contains("certificate is not valid for")
        {
            Some(Self::HostMismatch)
        } else if t.contains("certificate verify failed")
            || t.contains("handshake failure")
            || t.contains("tls handshake")
            || t.contains("ssl routines")
        {
            Some(Self::Other)
        } else {
            None
        }
    }

    /// Walk an error source chain and classify the first TLS-shaped cause.
    pub(crate) fn classify(err: &(dyn StdError + 'static)) -> Option<Self> {
        let mut cur: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(e) = cur {
            if let Some(class) = Self::classify_str(&e.to_string()) {
                return Some(class);
            }
            cur = e.source();
        }
        None
    }
}

/// A classified TLS failure annotated with the URL it happened against.
#[derive(Debug, thiserror::Error)]
#[error("{url}: {}", .class.phrase())]
pub(crate) struct TlsError {
    pub(crate) class: TlsTrustError,
    pub(crate) url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_openssl_strings() {
        for (text, expected) in [
            (
                "error:0A000086:SSL routines:tls_post_process_server_certificate:certificate verify failed: certificate has expired",
                TlsTrustError::Expired,
            ),
            (
                "certificate verify failed: unable to get local issuer certificate",
                TlsTrustError::UnknownAuthority,
            ),
            (
                "certificate verify failed: self-signed certificate in certificate chain",
                TlsTrustError::UnknownAuthority,
            ),
            (
                "certificate verify failed: self-signed certificate",
                TlsTrustError::SelfSignedDepthZero,
            ),
            (
                "certificate verify failed: ee key too small",
                TlsTrustError::EndEntityKeyTooSmall,
            ),
            ("Hostname mismatch", TlsTrustError::HostMismatch),
            (
                "error:0A000410:SSL routines::ssl/tls alert handshake failure",
                TlsTrustError::Other,
            ),
        ] {
            assert_eq!(TlsTrustError::classify_str(text), Some(expected), "{text}");
        }
    }

    #[test]
    fn test_non_tls_errors_are_not_classified() {
        assert_eq!(TlsTrustError::classify_str("connection refused"), None);
        assert_eq!(TlsTrustError::classify_str("dns error"), None);
    }

    #[test]
    fn test_classify_walks_source_chain() {
        #[derive(Debug)]
        struct Outer(std::io::Error);
        impl std::fmt::Display for Outer {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "request failed")
            }
        }
        impl StdError for Outer {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }
        let inner = std::io::Error::other("certificate has expired");
        let err = Outer(inner);
        assert_eq!(
            TlsTrustError::classify(&err),
            Some(TlsTrustError::Expired)
        );
    }

    #[test]
    fn test_error_text_carries_phrase_and_url() {
        let e = TlsError {
            class: TlsTrustError::Expired,
            url: "https://updates.example.com".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("certificate has expired"));
        assert!(msg.contains("https://updates.example.com"));
    }
}
