use crate::pages::VirtAddr;

#[derive(Debug)]
pub enum Error {
    /// A user-supplied address cannot be resolved to a mapped page.
    /// The syscall layer terminates the offending process on this one.
    AddressViolation(VirtAddr),
    /// A mapping already exists where one was requested, or the request
    /// itself is malformed (zero-length file, unaligned address).
    BadMapping(VirtAddr),
    /// Block or file I/O came up short or failed outright.
    IoFailure(String),
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AddressViolation(vaddr) => {
                write!(f, "Address violation at {vaddr:#x}.")
            }
            Error::BadMapping(vaddr) => write!(f, "Bad mapping at {vaddr:#x}."),
            Error::IoFailure(context) => write!(f, "I/O failure: {context}."),
            Error::Internal(context) => write!(f, "Internal Error: {context}."),
        }
    }
}

impl std::error::Error for Error {}
