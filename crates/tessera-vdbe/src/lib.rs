//! VDBE program construction and statement code generation.
//!
//! The crate root holds the bytecode program model: [`ProgramBuilder`] with
//! its label, register and cursor allocation, and the finished
//! [`VdbeProgram`]. The [`codegen`] module turns statement descriptors into
//! programs. The foundational types (`Opcode`, `VdbeOp`, `P4`) live in
//! `tessera-types`.

use smallvec::SmallVec;
use tessera_error::{Result, TesseraError};
use tessera_types::opcode::{Opcode, P4, VdbeOp};

pub mod codegen;

pub use codegen::CodegenContext;

// ── Label System ────────────────────────────────────────────────────────────

/// An opaque handle representing a jump target.
///
/// Jumps to a label record a fixup; the target address is bound by
/// [`ProgramBuilder::resolve_label`] and written into every referencing
/// instruction by [`ProgramBuilder::finish`]. A label may be resolved before
/// or after the jumps that reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Internal tracking for one label.
#[derive(Debug, Default)]
struct LabelState {
    /// Bound address, once resolved.
    target: Option<i32>,
    /// Instructions whose `p2` takes the bound address.
    fixups: SmallVec<[usize; 4]>,
}

fn addr_i32(addr: usize) -> i32 {
    i32::try_from(addr).unwrap_or(i32::MAX)
}

// ── Register Allocator ──────────────────────────────────────────────────────

/// Sequential register allocator for the VDBE register file.
///
/// Registers are numbered starting at 1 (register 0 is reserved/unused,
/// matching C SQLite convention). Temporaries come from the same counter.
/// Returning a temporary is a no-op unless reuse is enabled, in which case
/// freed registers go to a pool that later `alloc_temp` calls drain.
#[derive(Debug)]
pub struct RegisterAllocator {
    /// The next register number to allocate (starts at 1).
    next_reg: i32,
    /// Pool of returned temporary registers available for reuse.
    temp_pool: Vec<i32>,
    reuse_temps: bool,
}

impl RegisterAllocator {
    /// Create a new allocator. First allocation returns register 1.
    pub fn new() -> Self {
        Self {
            next_reg: 1,
            temp_pool: Vec::new(),
            reuse_temps: false,
        }
    }

    /// Allocator whose freed temporaries are recycled.
    pub fn with_temp_reuse() -> Self {
        Self {
            reuse_temps: true,
            ..Self::new()
        }
    }

    /// Allocate a single persistent register.
    pub fn alloc_reg(&mut self) -> i32 {
        let reg = self.next_reg;
        self.next_reg += 1;
        reg
    }

    /// Allocate a contiguous block of `n` persistent registers.
    ///
    /// Returns the first register number. The block spans `[result, result+n)`.
    pub fn alloc_regs(&mut self, n: i32) -> i32 {
        let first = self.next_reg;
        self.next_reg += n.max(0);
        first
    }

    /// Allocate a temporary register (reuses from pool if available).
    pub fn alloc_temp(&mut self) -> i32 {
        self.temp_pool.pop().unwrap_or_else(|| self.alloc_reg())
    }

    /// Return a temporary register. Without reuse this does nothing.
    pub fn free_temp(&mut self, reg: i32) {
        if self.reuse_temps && !self.temp_pool.contains(&reg) {
            self.temp_pool.push(reg);
        }
    }

    /// The total number of registers allocated (high water mark).
    pub fn count(&self) -> i32 {
        self.next_reg - 1
    }
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ── VDBE Program Builder ────────────────────────────────────────────────────

/// A VDBE bytecode program under construction.
///
/// Provides methods to emit instructions, create/resolve labels for jumps,
/// and allocate registers and cursors. Once construction is complete, call
/// [`finish`](Self::finish) to patch jump targets and extract the program.
/// One builder serves exactly one compilation.
#[derive(Debug)]
pub struct ProgramBuilder {
    /// The instruction sequence.
    ops: Vec<VdbeOp>,
    /// Label states (indexed by `Label.0`).
    labels: Vec<LabelState>,
    /// Register allocator.
    regs: RegisterAllocator,
    /// Next cursor number (starts at 0).
    next_cursor: i32,
}

impl ProgramBuilder {
    /// Create a new empty program builder.
    pub fn new() -> Self {
        Self::with_registers(RegisterAllocator::new())
    }

    /// Builder that recycles freed temporary registers.
    pub fn with_temp_reuse() -> Self {
        Self::with_registers(RegisterAllocator::with_temp_reuse())
    }

    fn with_registers(regs: RegisterAllocator) -> Self {
        Self {
            ops: Vec::new(),
            labels: Vec::new(),
            regs,
            next_cursor: 0,
        }
    }

    // ── Instruction emission ────────────────────────────────────────────

    /// Emit a single instruction and return its address (index in `ops`).
    pub fn emit(&mut self, op: VdbeOp) -> usize {
        let addr = self.ops.len();
        self.ops.push(op);
        addr
    }

    /// Emit a simple instruction from parts.
    pub fn emit_op(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32, p4: P4, p5: u8) -> usize {
        self.emit(VdbeOp {
            opcode,
            p1,
            p2,
            p3,
            p4,
            p5,
        })
    }

    /// The current address (index of the next instruction to be emitted).
    pub fn current_addr(&self) -> usize {
        self.ops.len()
    }

    /// Get a reference to the instruction at `addr`.
    pub fn op_at(&self, addr: usize) -> Option<&VdbeOp> {
        self.ops.get(addr)
    }

    // ── Label system ────────────────────────────────────────────────────

    /// Create a new, unresolved label.
    #[allow(clippy::cast_possible_truncation)]
    pub fn emit_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(LabelState::default());
        Label(id)
    }

    /// Create a label already bound to the current address, for backward
    /// jumps to a loop head.
    pub fn label_here(&mut self) -> Label {
        let label = self.emit_label();
        self.resolve_label(label);
        label
    }

    /// Emit a jump instruction whose p2 target is `label`.
    ///
    /// p2 is written by [`finish`](Self::finish); until then it holds 0.
    pub fn emit_jump_to_label(
        &mut self,
        opcode: Opcode,
        p1: i32,
        p3: i32,
        label: Label,
        p4: P4,
        p5: u8,
    ) -> usize {
        let addr = self.emit_op(opcode, p1, 0, p3, p4, p5);
        if let Some(state) = self.labels.get_mut(label.0 as usize) {
            state.fixups.push(addr);
        }
        addr
    }

    /// Bind a label to the current address.
    pub fn resolve_label(&mut self, label: Label) {
        let addr = addr_i32(self.current_addr());
        self.resolve_label_to(label, addr);
    }

    /// Bind a label to an explicit address. Rebinding replaces the target.
    pub fn resolve_label_to(&mut self, label: Label, address: i32) {
        if let Some(state) = self.labels.get_mut(label.0 as usize) {
            state.target = Some(address);
        }
    }

    // ── Register allocation ─────────────────────────────────────────────

    /// Allocate a single persistent register.
    pub fn alloc_reg(&mut self) -> i32 {
        self.regs.alloc_reg()
    }

    /// Allocate a contiguous block of persistent registers.
    pub fn alloc_regs(&mut self, n: i32) -> i32 {
        self.regs.alloc_regs(n)
    }

    /// Allocate a temporary register.
    pub fn alloc_temp(&mut self) -> i32 {
        self.regs.alloc_temp()
    }

    /// Return a temporary register; a no-op unless temp reuse is on.
    pub fn free_temp(&mut self, reg: i32) {
        self.regs.free_temp(reg);
    }

    /// Total registers allocated (high water mark).
    pub fn register_count(&self) -> i32 {
        self.regs.count()
    }

    // ── Cursor allocation ───────────────────────────────────────────────

    /// Allocate the next cursor number.
    pub fn alloc_cursor(&mut self) -> i32 {
        let cursor = self.next_cursor;
        self.next_cursor += 1;
        cursor
    }

    /// Number of cursors allocated so far.
    pub fn cursor_count(&self) -> i32 {
        self.next_cursor
    }

    // ── Finalization ────────────────────────────────────────────────────

    /// Patch every label reference and return the finished program.
    ///
    /// A label that is referenced but never resolved is a compiler bug and
    /// fails the whole compilation.
    pub fn finish(mut self) -> Result<VdbeProgram> {
        for (i, state) in self.labels.iter().enumerate() {
            let target = match (state.target, state.fixups.is_empty()) {
                (Some(target), _) => target,
                (None, true) => continue,
                (None, false) => {
                    return Err(TesseraError::internal(format!(
                        "unresolved label {i} referenced by {} instruction(s)",
                        state.fixups.len()
                    )));
                }
            };
            for &addr in &state.fixups {
                if let Some(op) = self.ops.get_mut(addr) {
                    op.p2 = target;
                }
            }
        }

        Ok(VdbeProgram {
            ops: self.ops,
            register_count: self.regs.count(),
            cursor_count: self.next_cursor,
        })
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A finalized VDBE bytecode program ready for execution.
///
/// Plain data: it has no interior state and may be shared freely between
/// threads.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VdbeProgram {
    /// The instruction sequence.
    ops: Vec<VdbeOp>,
    /// Number of registers needed (high water mark from allocation).
    register_count: i32,
    /// Number of cursors opened by the program.
    cursor_count: i32,
}

impl VdbeProgram {
    /// The instruction sequence.
    pub fn ops(&self) -> &[VdbeOp] {
        &self.ops
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the program is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of registers required.
    pub fn register_count(&self) -> i32 {
        self.register_count
    }

    /// Number of cursors required.
    pub fn cursor_count(&self) -> i32 {
        self.cursor_count
    }

    /// Get the instruction at the given program counter.
    pub fn get(&self, pc: usize) -> Option<&VdbeOp> {
        self.ops.get(pc)
    }

    /// How many instructions carry `opcode`.
    pub fn count(&self, opcode: Opcode) -> usize {
        self.ops.iter().filter(|op| op.opcode == opcode).count()
    }

    /// Whether every jump instruction targets an address inside the program.
    pub fn jump_targets_in_bounds(&self) -> bool {
        let len = addr_i32(self.ops.len());
        self.ops
            .iter()
            .filter_map(VdbeOp::jump_target)
            .all(|target| (0..len).contains(&target))
    }

    /// Disassemble the program to a human-readable string.
    ///
    /// Output format matches SQLite's `EXPLAIN` output:
    /// ```text
    /// addr  opcode           p1    p2    p3    p4                 p5
    /// ----  ---------------  ----  ----  ----  -----------------  --
    /// 0     Init             0     1     0                        0
    /// ```
    pub fn disassemble(&self) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(self.ops.len() * 64 + 128);
        out.push_str("addr  opcode           p1    p2    p3    p4                 p5\n");
        out.push_str("----  ---------------  ----  ----  ----  -----------------  --\n");

        for (addr, op) in self.ops.iter().enumerate() {
            // Writing into a String cannot fail.
            let _ = writeln!(
                &mut out,
                "{addr:<4}  {:<15}  {:<4}  {:<4}  {:<4}  {:<17}  {:<2}",
                op.opcode.name(),
                op.p1,
                op.p2,
                op.p3,
                op.p4.to_string(),
                op.p5,
            );
        }

        out
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── test_label_emit_and_resolve ─────────────────────────────────────
    #[test]
    fn test_label_emit_and_resolve() {
        let mut b = ProgramBuilder::new();

        let label_a = b.emit_label();
        let label_b = b.emit_label();
        assert_ne!(label_a, label_b);

        // Forward reference: nothing is written until finish().
        let jump_addr = b.emit_jump_to_label(Opcode::Goto, 0, 0, label_a, P4::None, 0);
        assert_eq!(b.op_at(jump_addr).unwrap().p2, 0);

        b.emit_op(Opcode::Integer, 1, 1, 0, P4::None, 0);
        b.emit_op(Opcode::Integer, 2, 2, 0, P4::None, 0);
        b.resolve_label(label_a);

        let jump2 = b.emit_jump_to_label(Opcode::If, 1, 0, label_b, P4::None, 0);
        b.resolve_label(label_b);
        b.emit_op(Opcode::Halt, 0, 0, 0, P4::None, 0);

        let prog = b.finish().unwrap();
        assert_eq!(prog.len(), 5);
        assert_eq!(prog.get(jump_addr).unwrap().p2, 3);
        assert_eq!(prog.get(jump2).unwrap().p2, 4);
        assert!(prog.jump_targets_in_bounds());
    }

    #[test]
    fn test_backward_label() {
        let mut b = ProgramBuilder::new();
        b.emit_op(Opcode::Integer, 3, 1, 0, P4::None, 0);
        let top = b.label_here();
        let exit = b.emit_label();
        b.emit_jump_to_label(Opcode::DecrJumpZero, 1, 0, exit, P4::None, 0);
        b.emit_jump_to_label(Opcode::Goto, 0, 0, top, P4::None, 0);
        b.resolve_label(exit);
        b.emit_op(Opcode::Halt, 0, 0, 0, P4::None, 0);

        let prog = b.finish().unwrap();
        assert_eq!(prog.get(2).unwrap().p2, 1);
        assert_eq!(prog.get(1).unwrap().p2, 3);
    }

    // ── test_unresolved_label_error ─────────────────────────────────────
    #[test]
    fn test_unresolved_label_error() {
        let mut b = ProgramBuilder::new();
        let label = b.emit_label();
        b.emit_jump_to_label(Opcode::Goto, 0, 0, label, P4::None, 0);

        let err = b.finish().unwrap_err();
        assert!(matches!(err, TesseraError::Internal(_)));
        assert_eq!(err.category(), tessera_error::ErrorCategory::Compile);
    }

    #[test]
    fn test_unreferenced_unresolved_label_ok() {
        let mut b = ProgramBuilder::new();
        let _unused = b.emit_label();
        b.emit_op(Opcode::Halt, 0, 0, 0, P4::None, 0);
        assert!(b.finish().is_ok());
    }

    // ── test_register_alloc_sequential ──────────────────────────────────
    #[test]
    fn test_register_alloc_sequential() {
        let mut alloc = RegisterAllocator::new();
        assert_eq!(alloc.alloc_reg(), 1);
        assert_eq!(alloc.alloc_reg(), 2);
        assert_eq!(alloc.alloc_regs(3), 3);
        assert_eq!(alloc.alloc_reg(), 6);
        assert_eq!(alloc.count(), 6);
    }

    #[test]
    fn test_free_temp_is_noop_by_default() {
        let mut alloc = RegisterAllocator::new();
        let t = alloc.alloc_temp();
        alloc.free_temp(t);
        assert_ne!(alloc.alloc_temp(), t);
        assert_eq!(alloc.count(), 2);
    }

    #[test]
    fn test_register_temp_pool_reuse() {
        let mut alloc = RegisterAllocator::with_temp_reuse();
        let t1 = alloc.alloc_temp();
        let t2 = alloc.alloc_temp();
        alloc.free_temp(t2);
        alloc.free_temp(t2);
        assert_eq!(alloc.alloc_temp(), t2);
        assert_ne!(alloc.alloc_temp(), t1);
        assert_eq!(alloc.count(), 3);
    }

    #[test]
    fn test_cursor_alloc_starts_at_zero() {
        let mut b = ProgramBuilder::new();
        assert_eq!(b.alloc_cursor(), 0);
        assert_eq!(b.alloc_cursor(), 1);
        let prog = b.finish().unwrap();
        assert_eq!(prog.cursor_count(), 2);
    }

    // ── test_program_builder_basic ──────────────────────────────────────
    #[test]
    fn test_program_builder_basic() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_label();
        b.emit_jump_to_label(Opcode::Init, 0, 0, start, P4::None, 0);
        b.resolve_label(start);
        let r1 = b.alloc_reg();
        b.emit_op(Opcode::Integer, 42, r1, 0, P4::None, 0);
        b.emit_op(Opcode::ResultRow, r1, 1, 0, P4::None, 0);
        b.emit_op(Opcode::Halt, 0, 0, 0, P4::None, 0);

        let prog = b.finish().unwrap();
        assert_eq!(prog.len(), 4);
        assert_eq!(prog.register_count(), 1);
        assert_eq!(prog.get(0).unwrap().p2, 1);
        assert_eq!(prog.count(Opcode::Integer), 1);
    }

    #[test]
    fn test_jump_out_of_bounds_detected() {
        let mut b = ProgramBuilder::new();
        let end = b.emit_label();
        b.emit_jump_to_label(Opcode::Goto, 0, 0, end, P4::None, 0);
        b.resolve_label(end);
        let prog = b.finish().unwrap();
        // The only target is one past the last instruction.
        assert!(!prog.jump_targets_in_bounds());
    }

    // ── test_disassemble ────────────────────────────────────────────────
    #[test]
    fn test_disassemble() {
        let mut b = ProgramBuilder::new();
        b.emit_op(Opcode::Init, 0, 1, 0, P4::None, 0);
        b.emit_op(Opcode::Integer, 42, 1, 0, P4::None, 0);
        b.emit_op(Opcode::OpenRead, 0, 7, 0, P4::Table("users".to_owned()), 0);
        b.emit_op(Opcode::Halt, 0, 0, 0, P4::None, 0);
        let prog = b.finish().unwrap();

        let asm = prog.disassemble();
        assert_eq!(asm.lines().count(), 6);
        assert!(asm.contains("Integer"));
        assert!(asm.contains("(tbl)users"));
        assert!(asm.lines().nth(2).unwrap().starts_with("0     Init"));
    }

    #[test]
    fn test_program_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VdbeProgram>();
    }
}
