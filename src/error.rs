use enumflags2::BitFlags;

use crate::value::Tag;

pub type Result<T> = core::result::Result<T, Error>;

/// The seven error kinds from the error-handling design, plus the
/// `Halt` sentinel the dispatch loop uses to unwind on a normal `RET`.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    // Lex errors
    Lex { file: String, line: i32, column: i32, excerpt: String, message: String },
    // Parse errors
    Parse { file: String, line: i32, message: String },
    // Type errors
    TypeError { expect: BitFlags<Tag>, got: Tag },
    TypeMismatch(Tag, Tag),
    NotCallable(Tag),
    NoMetatable,
    // Range errors
    IndexOutOfRange(i64),
    StackOutOfRange(i32),
    UpvalOutOfRange(i32, i32),
    PopUnderflow,
    // Arithmetic errors
    DivideByZero,
    NegativeShift,
    // Resource errors
    StackOverflow,
    SelfReferential,
    // User panic
    Panic(String),
    // Lookup failures
    KeyError,
    UnresolvedUpvalue(String),
    DuplicateLocal(String),
    // Internal sentinel: normal end of a chunk's instruction stream.
    Halt,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Lex { file, line, column, excerpt, message } => {
                write!(f, "{}:{}:{}: {}\n{}", file, line, column, message, excerpt)
            }
            Error::Parse { file, line, message } => {
                write!(f, "{}:{}: {}", file, line, message)
            }
            Error::TypeError { expect, got } => {
                write!(f, "type error: expected one of {:?}, got {:?}", expect, got)
            }
            Error::TypeMismatch(a, b) => write!(f, "type mismatch: {:?} vs {:?}", a, b),
            Error::NotCallable(t) => write!(f, "{:?} value is not callable", t),
            Error::NoMetatable => write!(f, "managed object has no metatable"),
            Error::IndexOutOfRange(i) => write!(f, "index {} out of range", i),
            Error::StackOutOfRange(i) => write!(f, "stack index {} out of range", i),
            Error::UpvalOutOfRange(i, n) => {
                write!(f, "upvalue index {} out of range [0, {})", i, n)
            }
            Error::PopUnderflow => write!(f, "pop past stack bottom"),
            Error::DivideByZero => write!(f, "division or modulo by zero"),
            Error::NegativeShift => write!(f, "negative shift amount"),
            Error::StackOverflow => write!(f, "stack overflow"),
            Error::SelfReferential => write!(f, "self-referential container"),
            Error::Panic(msg) => write!(f, "{}", msg),
            Error::KeyError => write!(f, "key not found"),
            Error::UnresolvedUpvalue(name) => write!(f, "cannot resolve upvalue `{}`", name),
            Error::DuplicateLocal(name) => write!(f, "duplicate local `{}`", name),
            Error::Halt => write!(f, "halt"),
        }
    }
}

pub fn expected(expect: BitFlags<Tag>, got: Tag) -> Error {
    Error::TypeError { expect, got }
}

pub fn type_mismatch(a: Tag, b: Tag) -> Error {
    Error::TypeMismatch(a, b)
}
