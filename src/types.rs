//! Shared value, result-code and flag types.

use std::ffi::c_int;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use libsqlite3_sys as ffi;

/// Primary result codes reported by the native engine.
///
/// Extended codes are folded into their primary class; the raw extended value is kept on
/// [`crate::Error::Sqlite`] when one is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    Error,
    Internal,
    Perm,
    Abort,
    Busy,
    Locked,
    NoMem,
    ReadOnly,
    Interrupt,
    IoErr,
    Corrupt,
    NotFound,
    Full,
    CantOpen,
    Protocol,
    Empty,
    Schema,
    TooBig,
    Constraint,
    Mismatch,
    Misuse,
    NoLfs,
    Auth,
    Format,
    Range,
    NotADb,
    Notice,
    Warning,
    Row,
    Done,
    Unknown(i32),
}

impl ResultCode {
    pub fn from_raw(rc: c_int) -> Self {
        match rc & 0xff {
            0 => ResultCode::Ok,
            1 => ResultCode::Error,
            2 => ResultCode::Internal,
            3 => ResultCode::Perm,
            4 => ResultCode::Abort,
            5 => ResultCode::Busy,
            6 => ResultCode::Locked,
            7 => ResultCode::NoMem,
            8 => ResultCode::ReadOnly,
            9 => ResultCode::Interrupt,
            10 => ResultCode::IoErr,
            11 => ResultCode::Corrupt,
            12 => ResultCode::NotFound,
            13 => ResultCode::Full,
            14 => ResultCode::CantOpen,
            15 => ResultCode::Protocol,
            16 => ResultCode::Empty,
            17 => ResultCode::Schema,
            18 => ResultCode::TooBig,
            19 => ResultCode::Constraint,
            20 => ResultCode::Mismatch,
            21 => ResultCode::Misuse,
            22 => ResultCode::NoLfs,
            23 => ResultCode::Auth,
            24 => ResultCode::Format,
            25 => ResultCode::Range,
            26 => ResultCode::NotADb,
            27 => ResultCode::Notice,
            28 => ResultCode::Warning,
            100 => ResultCode::Row,
            101 => ResultCode::Done,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn as_raw(self) -> c_int {
        match self {
            ResultCode::Ok => 0,
            ResultCode::Error => 1,
            ResultCode::Internal => 2,
            ResultCode::Perm => 3,
            ResultCode::Abort => 4,
            ResultCode::Busy => 5,
            ResultCode::Locked => 6,
            ResultCode::NoMem => 7,
            ResultCode::ReadOnly => 8,
            ResultCode::Interrupt => 9,
            ResultCode::IoErr => 10,
            ResultCode::Corrupt => 11,
            ResultCode::NotFound => 12,
            ResultCode::Full => 13,
            ResultCode::CantOpen => 14,
            ResultCode::Protocol => 15,
            ResultCode::Empty => 16,
            ResultCode::Schema => 17,
            ResultCode::TooBig => 18,
            ResultCode::Constraint => 19,
            ResultCode::Mismatch => 20,
            ResultCode::Misuse => 21,
            ResultCode::NoLfs => 22,
            ResultCode::Auth => 23,
            ResultCode::Format => 24,
            ResultCode::Range => 25,
            ResultCode::NotADb => 26,
            ResultCode::Notice => 27,
            ResultCode::Warning => 28,
            ResultCode::Row => 100,
            ResultCode::Done => 101,
            ResultCode::Unknown(rc) => rc,
        }
    }

    /// Busy and Locked: another connection holds a conflicting lock.
    pub fn is_contention(self) -> bool {
        matches!(self, ResultCode::Busy | ResultCode::Locked)
    }

    /// Ok, Row and Done are the codes a pending cancellation overrides.
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Ok | ResultCode::Row | ResultCode::Done)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Ok => "not an error",
            ResultCode::Error => "SQL logic error",
            ResultCode::Internal => "internal logic error",
            ResultCode::Perm => "access permission denied",
            ResultCode::Abort => "query aborted",
            ResultCode::Busy => "database is locked",
            ResultCode::Locked => "database table is locked",
            ResultCode::NoMem => "out of memory",
            ResultCode::ReadOnly => "attempt to write a readonly database",
            ResultCode::Interrupt => "interrupted",
            ResultCode::IoErr => "disk I/O error",
            ResultCode::Corrupt => "database disk image is malformed",
            ResultCode::NotFound => "unknown operation",
            ResultCode::Full => "database or disk is full",
            ResultCode::CantOpen => "unable to open database file",
            ResultCode::Protocol => "locking protocol",
            ResultCode::Empty => "empty",
            ResultCode::Schema => "database schema has changed",
            ResultCode::TooBig => "string or blob too big",
            ResultCode::Constraint => "constraint failed",
            ResultCode::Mismatch => "datatype mismatch",
            ResultCode::Misuse => "bad parameter or other API misuse",
            ResultCode::NoLfs => "large file support is disabled",
            ResultCode::Auth => "authorization denied",
            ResultCode::Format => "auxiliary database format error",
            ResultCode::Range => "column index out of range",
            ResultCode::NotADb => "file is not a database",
            ResultCode::Notice => "notification message",
            ResultCode::Warning => "warning message",
            ResultCode::Row => "another row available",
            ResultCode::Done => "no more rows available",
            ResultCode::Unknown(rc) => return write!(f, "unknown result code {rc}"),
        };
        f.write_str(name)
    }
}

/// A single column or parameter value crossing the native boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Storage class of a column value in the current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Blob,
    Null,
}

impl ColumnType {
    pub(crate) fn from_raw(t: c_int) -> Self {
        match t {
            ffi::SQLITE_INTEGER => ColumnType::Integer,
            ffi::SQLITE_FLOAT => ColumnType::Float,
            ffi::SQLITE_TEXT => ColumnType::Text,
            ffi::SQLITE_BLOB => ColumnType::Blob,
            _ => ColumnType::Null,
        }
    }
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident($repr:ty) { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn from_bits(bits: $repr) -> Self {
                $name(bits)
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn union(self, other: $name) -> Self {
                $name(self.0 | other.0)
            }

            pub const fn difference(self, other: $name) -> Self {
                $name(self.0 & !other.0)
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                self.union(rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                *self = self.union(rhs);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut names = Vec::new();
                $(if $value != 0 && self.contains($name::$flag) {
                    names.push(stringify!($flag));
                })*
                write!(f, "{}({})", stringify!($name), names.join(" | "))
            }
        }
    };
}

flag_set! {
    /// Behavioural toggles of a connection, independent of the native open flags.
    ConnectionFlags(u32) {
        /// Skip binding the registered user-defined functions at open.
        NO_BIND_FUNCTIONS = 1 << 0;
        /// Unbind user-defined functions and collations when the connection closes.
        UNBIND_FUNCTIONS_ON_CLOSE = 1 << 1;
        /// Bind `u32` parameters as 64-bit integers instead of reinterpreting them as `i32`.
        BIND_UINT32_AS_INT64 = 1 << 2;
        /// Emit a debug event for every native prepare.
        LOG_PREPARE = 1 << 3;
        /// Emit a debug event for every backup step.
        LOG_BACKUP = 1 << 4;
        /// Use the legacy prepare entry point; schema changes then surface through reset.
        LEGACY_PREPARE = 1 << 5;
    }
}

flag_set! {
    /// Native open flags passed to the engine's open call.
    OpenFlags(c_int) {
        READ_ONLY = ffi::SQLITE_OPEN_READONLY;
        READ_WRITE = ffi::SQLITE_OPEN_READWRITE;
        CREATE = ffi::SQLITE_OPEN_CREATE;
        URI = ffi::SQLITE_OPEN_URI;
        MEMORY = ffi::SQLITE_OPEN_MEMORY;
        NO_MUTEX = ffi::SQLITE_OPEN_NOMUTEX;
        FULL_MUTEX = ffi::SQLITE_OPEN_FULLMUTEX;
        SHARED_CACHE = ffi::SQLITE_OPEN_SHAREDCACHE;
        PRIVATE_CACHE = ffi::SQLITE_OPEN_PRIVATECACHE;
    }
}

impl OpenFlags {
    /// The only flag set a pooled connection may be opened with.
    pub const DEFAULT: OpenFlags = OpenFlags::READ_WRITE.union(OpenFlags::CREATE);
}

/// Per-connection limits, see `sqlite3_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOption {
    Length,
    SqlLength,
    Column,
    ExprDepth,
    CompoundSelect,
    VdbeOp,
    FunctionArg,
    Attached,
    LikePatternLength,
    VariableNumber,
    TriggerDepth,
    WorkerThreads,
}

impl LimitOption {
    pub(crate) fn as_raw(self) -> c_int {
        match self {
            LimitOption::Length => ffi::SQLITE_LIMIT_LENGTH,
            LimitOption::SqlLength => ffi::SQLITE_LIMIT_SQL_LENGTH,
            LimitOption::Column => ffi::SQLITE_LIMIT_COLUMN,
            LimitOption::ExprDepth => ffi::SQLITE_LIMIT_EXPR_DEPTH,
            LimitOption::CompoundSelect => ffi::SQLITE_LIMIT_COMPOUND_SELECT,
            LimitOption::VdbeOp => ffi::SQLITE_LIMIT_VDBE_OP,
            LimitOption::FunctionArg => ffi::SQLITE_LIMIT_FUNCTION_ARG,
            LimitOption::Attached => ffi::SQLITE_LIMIT_ATTACHED,
            LimitOption::LikePatternLength => ffi::SQLITE_LIMIT_LIKE_PATTERN_LENGTH,
            LimitOption::VariableNumber => ffi::SQLITE_LIMIT_VARIABLE_NUMBER,
            LimitOption::TriggerDepth => ffi::SQLITE_LIMIT_TRIGGER_DEPTH,
            LimitOption::WorkerThreads => ffi::SQLITE_LIMIT_WORKER_THREADS,
        }
    }
}

/// Boolean per-connection configuration switches, see `sqlite3_db_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbConfigOption {
    EnableForeignKeys,
    EnableTriggers,
    EnableFts3Tokenizer,
    EnableLoadExtension,
    NoCheckpointOnClose,
    EnableQueryPlannerStability,
    TriggerExplainQueryPlan,
    ResetDatabase,
    Defensive,
    WritableSchema,
    LegacyAlterTable,
    DoubleQuotedStringDml,
    DoubleQuotedStringDdl,
    EnableViews,
    TrustedSchema,
}

impl DbConfigOption {
    pub(crate) fn as_raw(self) -> c_int {
        match self {
            DbConfigOption::EnableForeignKeys => ffi::SQLITE_DBCONFIG_ENABLE_FKEY,
            DbConfigOption::EnableTriggers => ffi::SQLITE_DBCONFIG_ENABLE_TRIGGER,
            DbConfigOption::EnableFts3Tokenizer => ffi::SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER,
            DbConfigOption::EnableLoadExtension => ffi::SQLITE_DBCONFIG_ENABLE_LOAD_EXTENSION,
            DbConfigOption::NoCheckpointOnClose => ffi::SQLITE_DBCONFIG_NO_CKPT_ON_CLOSE,
            DbConfigOption::EnableQueryPlannerStability => ffi::SQLITE_DBCONFIG_ENABLE_QPSG,
            DbConfigOption::TriggerExplainQueryPlan => ffi::SQLITE_DBCONFIG_TRIGGER_EQP,
            DbConfigOption::ResetDatabase => ffi::SQLITE_DBCONFIG_RESET_DATABASE,
            DbConfigOption::Defensive => ffi::SQLITE_DBCONFIG_DEFENSIVE,
            DbConfigOption::WritableSchema => ffi::SQLITE_DBCONFIG_WRITABLE_SCHEMA,
            DbConfigOption::LegacyAlterTable => ffi::SQLITE_DBCONFIG_LEGACY_ALTER_TABLE,
            DbConfigOption::DoubleQuotedStringDml => ffi::SQLITE_DBCONFIG_DQS_DML,
            DbConfigOption::DoubleQuotedStringDdl => ffi::SQLITE_DBCONFIG_DQS_DDL,
            DbConfigOption::EnableViews => ffi::SQLITE_DBCONFIG_ENABLE_VIEW,
            DbConfigOption::TrustedSchema => ffi::SQLITE_DBCONFIG_TRUSTED_SCHEMA,
        }
    }
}

/// Row change reported by the update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Insert,
    Update,
    Delete,
    Unknown(i32),
}

impl UpdateAction {
    pub(crate) fn from_raw(op: c_int) -> Self {
        match op {
            ffi::SQLITE_INSERT => UpdateAction::Insert,
            ffi::SQLITE_UPDATE => UpdateAction::Update,
            ffi::SQLITE_DELETE => UpdateAction::Delete,
            other => UpdateAction::Unknown(other),
        }
    }
}

/// Answer returned by an authorizer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Allow,
    Deny,
    Ignore,
}

impl Authorization {
    pub(crate) fn as_raw(self) -> c_int {
        match self {
            Authorization::Allow => ffi::SQLITE_OK,
            Authorization::Deny => ffi::SQLITE_DENY,
            Authorization::Ignore => ffi::SQLITE_IGNORE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_folds_extended_codes() {
        // SQLITE_BUSY_SNAPSHOT = SQLITE_BUSY | (2 << 8)
        assert_eq!(ResultCode::from_raw(5 | (2 << 8)), ResultCode::Busy);
        // SQLITE_LOCKED_SHAREDCACHE
        assert_eq!(ResultCode::from_raw(6 | (1 << 8)), ResultCode::Locked);
        assert_eq!(ResultCode::from_raw(ffi::SQLITE_ROW), ResultCode::Row);
        assert_eq!(ResultCode::from_raw(77), ResultCode::Unknown(77));
        assert_eq!(ResultCode::Schema.as_raw(), ffi::SQLITE_SCHEMA);
    }

    #[test]
    fn test_result_code_classes() {
        assert!(ResultCode::Busy.is_contention());
        assert!(ResultCode::Locked.is_contention());
        assert!(!ResultCode::Schema.is_contention());
        assert!(ResultCode::Done.is_success());
        assert!(!ResultCode::Interrupt.is_success());
    }

    #[test]
    fn test_open_flags_default() {
        assert!(OpenFlags::DEFAULT.contains(OpenFlags::READ_WRITE));
        assert!(OpenFlags::DEFAULT.contains(OpenFlags::CREATE));
        assert_ne!(OpenFlags::READ_ONLY, OpenFlags::DEFAULT);
        assert_eq!(format!("{:?}", OpenFlags::DEFAULT), "OpenFlags(READ_WRITE | CREATE)");
    }

    #[test]
    fn test_connection_flags_set_operations() {
        let mut flags = ConnectionFlags::NO_BIND_FUNCTIONS;
        flags |= ConnectionFlags::LOG_BACKUP;
        assert!(flags.contains(ConnectionFlags::LOG_BACKUP));
        assert!(!flags.contains(ConnectionFlags::LEGACY_PREPARE));
        let flags = flags.difference(ConnectionFlags::NO_BIND_FUNCTIONS);
        assert_eq!(flags, ConnectionFlags::LOG_BACKUP);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(7i32), Value::Integer(7));
        assert_eq!(Value::from(true), Value::Integer(1));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from("x"), Value::Text("x".into()));
    }
}
