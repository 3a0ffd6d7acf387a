/// VDBE opcodes emitted by the statement compilers.
///
/// This is the subset of the upstream SQLite opcode set that the code
/// generators and the reference interpreter agree on. Each variant documents
/// its operands; `r[N]` is register N, `P2` on a jump opcode is the target
/// address. Discriminants are dense, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // === Control Flow ===
    /// Jump to address P2.
    Goto = 1,
    /// Store the address of the next instruction in r[P1], jump to P2.
    Gosub = 2,
    /// Jump to the address held in r[P1].
    Return = 3,
    /// r[P1] = P3 (coroutine entry address). Jump to P2 when P2 is non-zero.
    InitCoroutine = 4,
    /// Jump to P2 of the `Yield` that last resumed the coroutine in r[P1].
    EndCoroutine = 5,
    /// Swap the program counter with r[P1]: store the next address in r[P1]
    /// and continue at the old value of r[P1].
    Yield = 6,
    /// Stop execution. P1 is the result code (0 = OK); P4 may carry a message.
    Halt = 7,
    /// Program entry. Jump to P2.
    Init = 8,
    /// Jump to P2 if r[P1] is true. A NULL r[P1] jumps only when P3 != 0.
    If = 9,
    /// Jump to P2 if r[P1] is false. A NULL r[P1] jumps only when P3 != 0.
    IfNot = 10,
    /// If r[P1] > 0 then r[P1] -= P3 and jump to P2.
    IfPos = 11,
    /// r[P1] -= 1; jump to P2 if the result is exactly zero.
    DecrJumpZero = 12,
    /// Coerce r[P1] to an integer. If that is impossible jump to P2, or fail
    /// with a mismatch error when P2 is 0.
    MustBeInt = 13,

    // === Constants & Values ===
    /// r[P2] = P1.
    Integer = 14,
    /// r[P2] = 64-bit integer in P4.
    Int64 = 15,
    /// r[P2] = float in P4.
    Real = 16,
    /// r[P2] = string in P4.
    String8 = 17,
    /// r[P2] = string in P4, whose length in bytes is P1.
    String = 18,
    /// r[P2] = NULL. When P3 > P2, every register P2..=P3 is set to NULL.
    Null = 19,
    /// r[P2] = blob of length P1 in P4.
    Blob = 20,

    // === Register Operations ===
    /// Copy the P3+1 registers starting at P1 into the registers starting
    /// at P2.
    Copy = 21,
    /// Shallow copy r[P1] into r[P2].
    SCopy = 22,

    // === Comparison ===
    //
    // Comparison opcodes test r[P3] OP r[P1]. By default they jump to P2
    // when the test holds; a NULL operand makes the test fail unless the
    // JUMPIFNULL flag is set. With STOREP2 in P5 they store the boolean
    // result (or NULL) into r[P2] instead of jumping. NULLEQ makes NULLs
    // compare equal to each other and unequal to everything else.
    /// r[P3] == r[P1].
    Eq = 23,
    /// r[P3] != r[P1].
    Ne = 24,
    /// r[P3] < r[P1].
    Lt = 25,
    /// r[P3] <= r[P1].
    Le = 26,
    /// r[P3] > r[P1].
    Gt = 27,
    /// r[P3] >= r[P1].
    Ge = 28,
    /// Jump to P2 if r[P1] is NULL.
    IsNull = 29,
    /// Jump to P2 if r[P1] is not NULL.
    NotNull = 30,

    // === Arithmetic ===
    /// r[P3] = r[P2] + r[P1].
    Add = 31,
    /// r[P3] = r[P2] - r[P1].
    Subtract = 32,
    /// r[P3] = r[P2] * r[P1].
    Multiply = 33,
    /// r[P3] = r[P2] / r[P1]. Division by zero yields NULL.
    Divide = 34,

    // === Logic ===
    /// r[P3] = r[P1] AND r[P2], with NULL as unknown.
    And = 35,
    /// r[P3] = r[P1] OR r[P2], with NULL as unknown.
    Or = 36,

    // === Cursor Lifecycle ===
    /// Open read cursor P1 on the b-tree rooted at page P2. P4 names the
    /// table (`P4::Table`) or index (`P4::Index`). With the `P2ISREG` flag
    /// the root page is read from r[P2].
    OpenRead = 37,
    /// Open write cursor P1 on the b-tree rooted at page P2. P4 as for
    /// `OpenRead`.
    OpenWrite = 38,
    /// Open cursor P1 on a fresh transient b-tree with P2 columns. A
    /// `P4::SortOrder` key description makes it a key-only index in which
    /// duplicate keys collapse; `P4::None` makes it a rowid table.
    OpenEphemeral = 39,
    /// Close cursor P1.
    Close = 40,
    /// Position cursor P1 on its first row; jump to P2 if it is empty.
    Rewind = 41,
    /// Position cursor P1 on its last row; jump to P2 if it is empty.
    Last = 42,
    /// Advance cursor P1; jump to P2 if a row is available.
    Next = 43,
    /// Move cursor P1 backwards; jump to P2 if a row is available.
    Prev = 44,
    /// Seek table cursor P1 to rowid r[P3]; jump to P2 if no such row.
    NotExists = 45,
    /// Jump to P2 if index cursor P1 contains the record key r[P3].
    Found = 46,
    /// Jump to P2 if index cursor P1 does not contain the record key r[P3].
    NotFound = 47,

    // === Row Access ===
    /// r[P3] = column P2 of the row under cursor P1. Columns past the end of
    /// a short record read as NULL.
    Column = 48,
    /// r[P2] = rowid of the row under cursor P1.
    Rowid = 49,
    /// r[P3] = record built from the P2 registers starting at P1. A
    /// `P4::Affinity` string is applied to the values first.
    MakeRecord = 50,
    /// r[P2] = a rowid one larger than the largest in table cursor P1.
    NewRowid = 51,
    /// Write record r[P2] under rowid r[P3] through cursor P1. P4 names the
    /// table.
    Insert = 52,
    /// Delete the row under cursor P1. P4 names the table.
    Delete = 53,
    /// Delete every entry of the b-tree rooted at page P1.
    Clear = 54,

    // === Index Operations ===
    /// Insert record key r[P2] into index cursor P1. An existing equal key
    /// is left in place.
    IdxInsert = 55,
    /// Remove record key r[P2] from index cursor P1, if present.
    IdxDelete = 56,

    // === Sorter ===
    /// Open sorter cursor P1 whose records lead with P2 key columns. P4 is a
    /// `P4::SortOrder` string with one `+` (ascending) or `-` (descending)
    /// per key column.
    SorterOpen = 57,
    /// Add record r[P2] to sorter P1.
    SorterInsert = 58,
    /// Sort sorter P1 and position on its first record; jump to P2 if empty.
    SorterSort = 59,
    /// r[P2] = the current record of sorter P1. `Column` on a sorter cursor
    /// reads fields of the same record.
    SorterData = 60,
    /// Advance sorter P1; jump to P2 if a record is available.
    SorterNext = 61,

    // === RowSet ===
    /// Add integer r[P2] to the rowset held in r[P1].
    RowSetAdd = 62,
    /// Remove the smallest value from rowset r[P1] into r[P3]; jump to P2 if
    /// the rowset is empty.
    RowSetRead = 63,

    // === Aggregates ===
    /// Step aggregate function P4 (`P4::FuncName`) with the P5 arguments
    /// starting at r[P2], accumulating into r[P3].
    AggStep = 64,
    /// Finalize the accumulator in r[P1] for aggregate function P4; P2 is
    /// the argument count.
    AggFinal = 65,

    // === Results ===
    /// Emit the P2 registers starting at P1 as one result row.
    ResultRow = 66,

    // === Schema & Constraints ===
    /// Check foreign-key constraints for the row under cursor P1 before it
    /// is deleted. P4 names the parent table.
    FkCheck = 67,
    /// Allocate a new b-tree; store its root page in r[P2]. P3 is 1 for a
    /// rowid table and 2 for an index.
    CreateBtree = 68,

    /// No operation.
    Noop = 69,
}

impl Opcode {
    /// Total number of opcodes defined.
    pub const COUNT: usize = 69;

    /// Get the opcode name as a static string slice.
    #[allow(clippy::too_many_lines)]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Goto => "Goto",
            Self::Gosub => "Gosub",
            Self::Return => "Return",
            Self::InitCoroutine => "InitCoroutine",
            Self::EndCoroutine => "EndCoroutine",
            Self::Yield => "Yield",
            Self::Halt => "Halt",
            Self::Init => "Init",
            Self::If => "If",
            Self::IfNot => "IfNot",
            Self::IfPos => "IfPos",
            Self::DecrJumpZero => "DecrJumpZero",
            Self::MustBeInt => "MustBeInt",
            Self::Integer => "Integer",
            Self::Int64 => "Int64",
            Self::Real => "Real",
            Self::String8 => "String8",
            Self::String => "String",
            Self::Null => "Null",
            Self::Blob => "Blob",
            Self::Copy => "Copy",
            Self::SCopy => "SCopy",
            Self::Eq => "Eq",
            Self::Ne => "Ne",
            Self::Lt => "Lt",
            Self::Le => "Le",
            Self::Gt => "Gt",
            Self::Ge => "Ge",
            Self::IsNull => "IsNull",
            Self::NotNull => "NotNull",
            Self::Add => "Add",
            Self::Subtract => "Subtract",
            Self::Multiply => "Multiply",
            Self::Divide => "Divide",
            Self::And => "And",
            Self::Or => "Or",
            Self::OpenRead => "OpenRead",
            Self::OpenWrite => "OpenWrite",
            Self::OpenEphemeral => "OpenEphemeral",
            Self::Close => "Close",
            Self::Rewind => "Rewind",
            Self::Last => "Last",
            Self::Next => "Next",
            Self::Prev => "Prev",
            Self::NotExists => "NotExists",
            Self::Found => "Found",
            Self::NotFound => "NotFound",
            Self::Column => "Column",
            Self::Rowid => "Rowid",
            Self::MakeRecord => "MakeRecord",
            Self::NewRowid => "NewRowid",
            Self::Insert => "Insert",
            Self::Delete => "Delete",
            Self::Clear => "Clear",
            Self::IdxInsert => "IdxInsert",
            Self::IdxDelete => "IdxDelete",
            Self::SorterOpen => "SorterOpen",
            Self::SorterInsert => "SorterInsert",
            Self::SorterSort => "SorterSort",
            Self::SorterData => "SorterData",
            Self::SorterNext => "SorterNext",
            Self::RowSetAdd => "RowSetAdd",
            Self::RowSetRead => "RowSetRead",
            Self::AggStep => "AggStep",
            Self::AggFinal => "AggFinal",
            Self::ResultRow => "ResultRow",
            Self::FkCheck => "FkCheck",
            Self::CreateBtree => "CreateBtree",
            Self::Noop => "Noop",
        }
    }

    /// Try to convert a raw byte to an opcode.
    #[allow(clippy::too_many_lines)]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        // No unsafe transmute; the match is the table.
        Some(match byte {
            1 => Self::Goto,
            2 => Self::Gosub,
            3 => Self::Return,
            4 => Self::InitCoroutine,
            5 => Self::EndCoroutine,
            6 => Self::Yield,
            7 => Self::Halt,
            8 => Self::Init,
            9 => Self::If,
            10 => Self::IfNot,
            11 => Self::IfPos,
            12 => Self::DecrJumpZero,
            13 => Self::MustBeInt,
            14 => Self::Integer,
            15 => Self::Int64,
            16 => Self::Real,
            17 => Self::String8,
            18 => Self::String,
            19 => Self::Null,
            20 => Self::Blob,
            21 => Self::Copy,
            22 => Self::SCopy,
            23 => Self::Eq,
            24 => Self::Ne,
            25 => Self::Lt,
            26 => Self::Le,
            27 => Self::Gt,
            28 => Self::Ge,
            29 => Self::IsNull,
            30 => Self::NotNull,
            31 => Self::Add,
            32 => Self::Subtract,
            33 => Self::Multiply,
            34 => Self::Divide,
            35 => Self::And,
            36 => Self::Or,
            37 => Self::OpenRead,
            38 => Self::OpenWrite,
            39 => Self::OpenEphemeral,
            40 => Self::Close,
            41 => Self::Rewind,
            42 => Self::Last,
            43 => Self::Next,
            44 => Self::Prev,
            45 => Self::NotExists,
            46 => Self::Found,
            47 => Self::NotFound,
            48 => Self::Column,
            49 => Self::Rowid,
            50 => Self::MakeRecord,
            51 => Self::NewRowid,
            52 => Self::Insert,
            53 => Self::Delete,
            54 => Self::Clear,
            55 => Self::IdxInsert,
            56 => Self::IdxDelete,
            57 => Self::SorterOpen,
            58 => Self::SorterInsert,
            59 => Self::SorterSort,
            60 => Self::SorterData,
            61 => Self::SorterNext,
            62 => Self::RowSetAdd,
            63 => Self::RowSetRead,
            64 => Self::AggStep,
            65 => Self::AggFinal,
            66 => Self::ResultRow,
            67 => Self::FkCheck,
            68 => Self::CreateBtree,
            69 => Self::Noop,
            _ => return None,
        })
    }

    /// Whether this opcode uses P2 as a jump target.
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            Self::Goto
                | Self::Gosub
                | Self::InitCoroutine
                | Self::Init
                | Self::If
                | Self::IfNot
                | Self::IfPos
                | Self::DecrJumpZero
                | Self::MustBeInt
                | Self::Eq
                | Self::Ne
                | Self::Lt
                | Self::Le
                | Self::Gt
                | Self::Ge
                | Self::IsNull
                | Self::NotNull
                | Self::Rewind
                | Self::Last
                | Self::Next
                | Self::Prev
                | Self::NotExists
                | Self::Found
                | Self::NotFound
                | Self::SorterSort
                | Self::SorterNext
                | Self::RowSetRead
        )
    }

    /// Whether this is one of the six comparison opcodes.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Flag bits carried in [`VdbeOp::p5`].
pub mod p5 {
    /// OpenRead/OpenWrite: P2 is a register holding the root page.
    pub const P2ISREG: u8 = 0x02;
    /// Comparison: jump when either operand is NULL.
    pub const JUMPIFNULL: u8 = 0x10;
    /// Comparison: store the result in r[P2] instead of jumping.
    pub const STOREP2: u8 = 0x20;
    /// Comparison: NULL equals NULL, NULL differs from any value.
    pub const NULLEQ: u8 = 0x80;
}

/// A single VDBE instruction.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VdbeOp {
    /// The opcode.
    pub opcode: Opcode,
    /// First operand (typically a register number or cursor index).
    pub p1: i32,
    /// Second operand (often a jump target address).
    pub p2: i32,
    /// Third operand.
    pub p3: i32,
    /// Fourth operand, typed per opcode.
    pub p4: P4,
    /// Fifth operand: flag bits, see [`p5`].
    pub p5: u8,
}

impl VdbeOp {
    /// The address this instruction may branch to, if it branches at all.
    ///
    /// Comparisons carrying `STOREP2` write a register instead of jumping,
    /// and `InitCoroutine`/`MustBeInt` treat a zero P2 as "no target".
    pub const fn jump_target(&self) -> Option<i32> {
        if !self.opcode.is_jump() {
            return None;
        }
        if self.opcode.is_comparison() && self.p5 & p5::STOREP2 != 0 {
            return None;
        }
        if matches!(self.opcode, Opcode::InitCoroutine | Opcode::MustBeInt) && self.p2 == 0 {
            return None;
        }
        Some(self.p2)
    }

    /// Instruction with no P4 payload and no flags.
    pub const fn new(opcode: Opcode, p1: i32, p2: i32, p3: i32) -> Self {
        Self {
            opcode,
            p1,
            p2,
            p3,
            p4: P4::None,
            p5: 0,
        }
    }
}

/// The P4 operand of a VDBE instruction.
///
/// P4 is a polymorphic operand that can hold different types depending on
/// the opcode.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum P4 {
    /// No P4 value.
    None,
    /// A 32-bit integer value.
    Int(i32),
    /// A 64-bit integer value.
    Int64(i64),
    /// A 64-bit float value.
    Real(f64),
    /// A string value.
    Str(String),
    /// A blob value.
    Blob(Vec<u8>),
    /// A table name.
    Table(String),
    /// An index name.
    Index(String),
    /// An aggregate function name (for `AggStep`/`AggFinal`).
    FuncName(String),
    /// An affinity string (one char per column).
    Affinity(String),
    /// A sort-order string (one `+` or `-` per key column).
    SortOrder(String),
}

impl std::fmt::Display for P4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Int(v) => write!(f, "(int){v}"),
            Self::Int64(v) => write!(f, "(i64){v}"),
            Self::Real(v) => write!(f, "(real){v}"),
            Self::Str(s) => write!(f, "(str){s}"),
            Self::Blob(b) => write!(f, "(blob)[{}B]", b.len()),
            Self::Table(t) => write!(f, "(tbl){t}"),
            Self::Index(i) => write!(f, "(idx){i}"),
            Self::FuncName(name) => write!(f, "(func){name}"),
            Self::Affinity(a) => write!(f, "(aff){a}"),
            Self::SortOrder(s) => write!(f, "(sort){s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn opcode_count_matches_from_byte_range() {
        let mut seen = 0;
        for byte in 0..=u8::MAX {
            if Opcode::from_byte(byte).is_some() {
                seen += 1;
            }
        }
        assert_eq!(seen, Opcode::COUNT);
    }

    #[test]
    fn opcode_from_byte() {
        assert_eq!(Opcode::from_byte(0), None);
        assert_eq!(Opcode::from_byte(1), Some(Opcode::Goto));
        assert_eq!(Opcode::from_byte(8), Some(Opcode::Init));
        assert_eq!(Opcode::from_byte(35), Some(Opcode::And));
        assert_eq!(Opcode::from_byte(69), Some(Opcode::Noop));
        assert_eq!(Opcode::from_byte(70), None);
    }

    #[test]
    fn from_byte_agrees_with_discriminant() {
        for byte in 1..=u8::try_from(Opcode::COUNT).unwrap() {
            let op = Opcode::from_byte(byte).unwrap();
            assert_eq!(op as u8, byte, "{op}");
        }
    }

    #[test]
    fn opcode_names_unique() {
        let names: HashSet<&str> = (1..=u8::try_from(Opcode::COUNT).unwrap())
            .filter_map(Opcode::from_byte)
            .map(Opcode::name)
            .collect();
        assert_eq!(names.len(), Opcode::COUNT);
        assert_eq!(Opcode::SorterData.to_string(), "SorterData");
    }

    #[test]
    fn opcode_is_jump() {
        assert!(Opcode::Goto.is_jump());
        assert!(Opcode::IfNot.is_jump());
        assert!(Opcode::Ne.is_jump());
        assert!(Opcode::RowSetRead.is_jump());
        assert!(Opcode::Init.is_jump());
        assert!(!Opcode::Insert.is_jump());
        assert!(!Opcode::Return.is_jump());
        assert!(!Opcode::Yield.is_jump());
        assert!(!Opcode::Halt.is_jump());
    }

    #[test]
    fn p4_display() {
        assert_eq!(P4::None.to_string(), "");
        assert_eq!(P4::Table("users".into()).to_string(), "(tbl)users");
        assert_eq!(P4::Blob(vec![1, 2, 3]).to_string(), "(blob)[3B]");
        assert_eq!(P4::Affinity("DBB".into()).to_string(), "(aff)DBB");
    }

    #[test]
    fn vdbe_op_serializes_with_tagged_payload() {
        let op = VdbeOp {
            opcode: Opcode::Insert,
            p1: 0,
            p2: 3,
            p3: 2,
            p4: P4::Table("users".to_owned()),
            p5: 0,
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"Insert\""), "{json}");
        let back: VdbeOp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn jump_target_skips_register_stores() {
        let mut cmp = VdbeOp::new(Opcode::Lt, 2, 5, 1);
        assert_eq!(cmp.jump_target(), Some(5));
        cmp.p5 = p5::STOREP2;
        assert_eq!(cmp.jump_target(), None);
        assert_eq!(VdbeOp::new(Opcode::MustBeInt, 1, 0, 0).jump_target(), None);
        assert_eq!(VdbeOp::new(Opcode::InitCoroutine, 1, 0, 4).jump_target(), None);
        assert_eq!(VdbeOp::new(Opcode::Insert, 0, 2, 1).jump_target(), None);
    }

    #[test]
    fn vdbe_op_new_has_empty_payload() {
        let op = VdbeOp::new(Opcode::Integer, 7, 1, 0);
        assert_eq!(op.p4, P4::None);
        assert_eq!(op.p5, 0);
    }
}
