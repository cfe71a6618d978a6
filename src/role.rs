//! Which side of the link may perform which operation.
//!
//! The protocol is symmetric on paper, but some operations only make sense
//! for the side that owns a particular ring end. The host, for example,
//! never takes buffers off a free list; it only returns them.

use crate::error::{Error, Result};

/// A side of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The application processor running this crate.
    Host,
    /// The modem.
    Coprocessor,
}

/// Where an operation is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Host only.
    HostOnly,
    /// Modem only.
    CoprocessorOnly,
    /// Either side.
    Shared,
}

impl Role {
    /// Is this role available on `side`?
    pub const fn allows(self, side: Side) -> bool {
        match (self, side) {
            (Role::Shared, _) => true,
            (Role::HostOnly, Side::Host) => true,
            (Role::CoprocessorOnly, Side::Coprocessor) => true,
            _ => false,
        }
    }
}

/// Every entry point of the channel API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Instance initialisation.
    Init,
    /// Channel configuration.
    Configure,
    /// Copy a message into a message channel.
    SendMsg,
    /// Copy a message out of a message channel.
    RecvMsg,
    /// Publish a buffer descriptor on a pointer channel.
    SendPtr,
    /// Take a descriptor off a pointer channel.
    RecvPtr,
    /// Look at the next message in place.
    RecvNonCopy,
    /// Release a message looked at in place.
    MarkConsumed,
    /// Return a pointer-channel buffer to the free list.
    PutBuf,
    /// Take a buffer off the free list.
    GetBuf,
    /// Mark a produced buffer as filled.
    SetProducedStatus,
    /// Address of the next buffer to produce into.
    GetProdBufPtr,
    /// Stock the free list.
    InitPtrBufList,
    /// Query whether a receive is pending.
    CheckRecvStatus,
    /// Event handle of a channel.
    GetEventHandle,
    /// Teardown.
    Shutdown,
}

impl Operation {
    /// The role of this operation.
    pub const fn role(self) -> Role {
        match self {
            Operation::SendPtr
            | Operation::GetBuf
            | Operation::SetProducedStatus
            | Operation::GetProdBufPtr
            | Operation::InitPtrBufList
            | Operation::CheckRecvStatus => Role::CoprocessorOnly,
            Operation::PutBuf | Operation::RecvPtr => Role::HostOnly,
            Operation::Init
            | Operation::Configure
            | Operation::SendMsg
            | Operation::RecvMsg
            | Operation::RecvNonCopy
            | Operation::MarkConsumed
            | Operation::GetEventHandle
            | Operation::Shutdown => Role::Shared,
        }
    }

    /// Fail with [`Error::NotImplemented`] unless valid on `side`.
    pub fn check(self, side: Side) -> Result<()> {
        if self.role().allows(side) {
            Ok(())
        } else {
            Err(Error::NotImplemented(self))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coprocessor_only_rejected_on_host() {
        for op in [
            Operation::SendPtr,
            Operation::GetBuf,
            Operation::SetProducedStatus,
            Operation::GetProdBufPtr,
            Operation::InitPtrBufList,
            Operation::CheckRecvStatus,
        ] {
            assert!(matches!(op.check(Side::Host), Err(Error::NotImplemented(o)) if o == op));
            assert!(op.check(Side::Coprocessor).is_ok());
        }
    }

    #[test]
    fn test_host_only_and_shared() {
        assert!(Operation::PutBuf.check(Side::Host).is_ok());
        assert!(Operation::RecvPtr.check(Side::Coprocessor).is_err());
        assert!(Operation::SendMsg.check(Side::Host).is_ok());
        assert!(Operation::SendMsg.check(Side::Coprocessor).is_ok());
    }
}
