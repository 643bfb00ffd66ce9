/*! The cross-cutting failure taxonomy and the completion results delivered
to callers.

Receiver-side kinds (`Malformed`, `BadSignature`, `BadAddress`) cause the
offending frame or connection to be dropped where it arrived; they are never
surfaced to the originator. The remaining kinds surface to the originating
call through its completion hook.
*/

use thiserror::Error;

use veil_packet::contact::RcError;

/// Every failure condition in the core maps to one of these kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ErrorKind {
    /// Wire frame fails to parse or fails type/length checks.
    #[error("Wire frame fails to parse or fails type/length checks")]
    Malformed,
    /// Cryptographic verification of a contact, frame or response failed.
    #[error("Cryptographic verification of a contact, frame or response failed")]
    BadSignature,
    /// Contact past its expiry, or path past its deadline.
    #[error("Contact past its expiry, or path past its deadline")]
    Expired,
    /// Contact advertises a forbidden address.
    #[error("Contact advertises a forbidden address")]
    BadAddress,
    /// No route to the required router and establishment refused.
    #[error("No route to the required router and establishment refused")]
    NoLink,
    /// Build, connect or reply deadline reached.
    #[error("Build, connect or reply deadline reached")]
    Timeout,
    /// Router id unknown and unresolvable.
    #[error("Router id unknown and unresolvable")]
    RouterNotFound,
    /// Router id known but refused by policy.
    #[error("Router id known but refused by policy")]
    InvalidRouter,
}

impl From<&RcError> for ErrorKind {
    fn from(e: &RcError) -> ErrorKind {
        match e {
            RcError::Malformed | RcError::Io(_) => ErrorKind::Malformed,
            RcError::BadSignature => ErrorKind::BadSignature,
            RcError::Expired => ErrorKind::Expired,
            RcError::Bogon => ErrorKind::BadAddress,
        }
    }
}

/// Completion of a control request, delivered to its hook exactly once.
#[derive(Debug)]
pub enum ControlResult {
    /// Successful response body from the remote endpoint.
    Response(Vec<u8>),
    /// Error string reported by the remote endpoint.
    Error(Vec<u8>),
    /// Reply deadline passed.
    TimedOut,
    /// The owning path or request was dropped before completion.
    Cancelled,
    /// Connection closed while the request was in flight.
    LinkClosed,
    /// The request could not be submitted or its reply could not be used.
    Failed(ErrorKind),
}

impl ControlResult {
    /// The response body if the request succeeded.
    pub fn into_response(self) -> Result<Vec<u8>, ErrorKind> {
        match self {
            ControlResult::Response(body) => Ok(body),
            ControlResult::TimedOut => Err(ErrorKind::Timeout),
            ControlResult::Failed(kind) => Err(kind),
            ControlResult::Error(_) | ControlResult::Cancelled | ControlResult::LinkClosed => Err(ErrorKind::NoLink),
        }
    }
}

/// Hook invoked with the completion of a control request.
pub type ControlHook = Box<dyn FnOnce(ControlResult) + Send + Sync + 'static>;

/// Hook invoked when a dialled connection opens.
pub type ConnectHook = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Hook invoked when a connection closes; `None` means a clean shutdown.
pub type CloseHook = Box<dyn FnOnce(Option<ErrorKind>) + Send + Sync + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_error_mapping() {
        assert_eq!(ErrorKind::from(&RcError::Malformed), ErrorKind::Malformed);
        assert_eq!(ErrorKind::from(&RcError::BadSignature), ErrorKind::BadSignature);
        assert_eq!(ErrorKind::from(&RcError::Expired), ErrorKind::Expired);
        assert_eq!(ErrorKind::from(&RcError::Bogon), ErrorKind::BadAddress);
    }

    #[test]
    fn into_response() {
        assert_eq!(ControlResult::Response(vec![1]).into_response(), Ok(vec![1]));
        assert_eq!(ControlResult::TimedOut.into_response(), Err(ErrorKind::Timeout));
        assert_eq!(
            ControlResult::Failed(ErrorKind::RouterNotFound).into_response(),
            Err(ErrorKind::RouterNotFound)
        );
    }
}
