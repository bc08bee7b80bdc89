use std::io;

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

#[allow(missing_docs)]
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// Key length exceeds [crate::MAX_KEY_SIZE].
    OversizeKey(#[error(not(source))] usize),
    /// Value length exceeds [crate::MAX_VALUE_SIZE].
    OversizeValue(#[error(not(source))] usize),
    /// The empty key is reserved for internal use.
    EmptyKey,
    /// A page didn't decode as a valid tree node.
    Corrupted(#[error(not(source))] TinyStr),
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io(i) => i.kind(),
            Error::Corrupted(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, value)
    }
}

macro_rules! error_corrupted {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Corrupted(msg.into())
    }}
}

pub(crate) use error_corrupted;
