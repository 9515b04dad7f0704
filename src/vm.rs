//! Register bytecode executed by the host backend.
//!
//! The assembler lowers each size group into one `CpuProgram`; the task
//! pool then runs contiguous lane ranges through `exec`. Every lane owns
//! its program counter, which gives the same per-lane divergence semantics
//! as the branches in generated PTX. Scatters go through host atomics so
//! parallel blocks may hit the same destination array.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::op::{self, OpKind};
use crate::types::VarType;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instr {
    /// Raw parameter word (array base pointers, pointer literals).
    LoadParam { dst: u16, slot: u16 },
    /// Element load through a parameter pointer; `broadcast` pins lane 0.
    Load { dst: u16, slot: u16, ty: VarType, broadcast: bool },
    /// Element store through a parameter pointer.
    Store { slot: u16, src: u16, ty: VarType },
    Imm { dst: u16, value: u64 },
    Counter { dst: u16 },
    /// Unary/binary arithmetic; semantics shared with the literal folder.
    Op2 { kind: OpKind, ty: VarType, dst: u16, a: u16, b: u16 },
    Select { dst: u16, mask: u16, a: u16, b: u16 },
    Cast { dst: u16, src: u16, to: VarType, from: VarType },
    Mov { dst: u16, src: u16 },
    Jump { target: u32 },
    JumpIfNot { mask: u16, target: u32 },
    /// Masked atomic accumulation through a pointer register.
    Scatter { ptr: u16, index: u16, value: u16, mask: u16, ty: VarType },
}

#[derive(Debug, Default, Clone)]
pub struct CpuProgram {
    pub instrs: Vec<Instr>,
    pub n_regs: u32,
}

#[inline]
unsafe fn load_elem(ptr: u64, index: u64, ty: VarType) -> u64 {
    let addr = ptr + index * ty.size() as u64;
    unsafe {
        match ty.size() {
            1 => *(addr as *const u8) as u64,
            2 => *(addr as *const u16) as u64,
            4 => *(addr as *const u32) as u64,
            _ => *(addr as *const u64),
        }
    }
}

#[inline]
unsafe fn store_elem(ptr: u64, index: u64, ty: VarType, value: u64) {
    let addr = ptr + index * ty.size() as u64;
    unsafe {
        match ty.size() {
            1 => *(addr as *mut u8) = value as u8,
            2 => *(addr as *mut u16) = value as u16,
            4 => *(addr as *mut u32) = value as u32,
            _ => *(addr as *mut u64) = value,
        }
    }
}

unsafe fn atomic_add(addr: u64, ty: VarType, value: u64) {
    unsafe {
        match ty {
            VarType::I32 | VarType::U32 => {
                (*(addr as *const AtomicU32)).fetch_add(value as u32, Ordering::Relaxed);
            }
            VarType::I64 | VarType::U64 => {
                (*(addr as *const AtomicU64)).fetch_add(value, Ordering::Relaxed);
            }
            VarType::F32 => {
                let atom = &*(addr as *const AtomicU32);
                let mut current = atom.load(Ordering::Relaxed);
                loop {
                    let next = (f32::from_bits(current) + f32::from_bits(value as u32)).to_bits();
                    match atom.compare_exchange_weak(
                        current,
                        next,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(observed) => current = observed,
                    }
                }
            }
            VarType::F64 => {
                let atom = &*(addr as *const AtomicU64);
                let mut current = atom.load(Ordering::Relaxed);
                loop {
                    let next = (f64::from_bits(current) + f64::from_bits(value)).to_bits();
                    match atom.compare_exchange_weak(
                        current,
                        next,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(observed) => current = observed,
                    }
                }
            }
            other => panic!("scatter: unsupported element type {}", other.name()),
        }
    }
}

impl CpuProgram {
    /// Run lanes `start..end` against the marshalled parameter vector.
    pub fn exec(&self, start: u32, end: u32, params: &[u64]) {
        let mut regs = vec![0u64; self.n_regs as usize];
        for lane in start..end {
            let mut pc = 0usize;
            while pc < self.instrs.len() {
                match self.instrs[pc] {
                    Instr::LoadParam { dst, slot } => {
                        regs[dst as usize] = params[slot as usize];
                    }
                    Instr::Load { dst, slot, ty, broadcast } => {
                        let index = if broadcast { 0 } else { lane as u64 };
                        regs[dst as usize] =
                            unsafe { load_elem(params[slot as usize], index, ty) };
                    }
                    Instr::Store { slot, src, ty } => unsafe {
                        store_elem(params[slot as usize], lane as u64, ty, regs[src as usize]);
                    },
                    Instr::Imm { dst, value } => regs[dst as usize] = value,
                    Instr::Counter { dst } => regs[dst as usize] = lane as u64,
                    Instr::Op2 { kind, ty, dst, a, b } => {
                        let args = [regs[a as usize], regs[b as usize]];
                        regs[dst as usize] = op::fold(kind, ty, &args)
                            .unwrap_or_else(|| panic!("vm: cannot evaluate {kind:?}"));
                    }
                    Instr::Select { dst, mask, a, b } => {
                        regs[dst as usize] = if regs[mask as usize] != 0 {
                            regs[a as usize]
                        } else {
                            regs[b as usize]
                        };
                    }
                    Instr::Cast { dst, src, to, from } => {
                        regs[dst as usize] = op::fold_cast(to, from, regs[src as usize]);
                    }
                    Instr::Mov { dst, src } => regs[dst as usize] = regs[src as usize],
                    Instr::Jump { target } => {
                        pc = target as usize;
                        continue;
                    }
                    Instr::JumpIfNot { mask, target } => {
                        if regs[mask as usize] == 0 {
                            pc = target as usize;
                            continue;
                        }
                    }
                    Instr::Scatter { ptr, index, value, mask, ty } => {
                        if regs[mask as usize] != 0 {
                            let addr =
                                regs[ptr as usize] + regs[index as usize] * ty.size() as u64;
                            unsafe { atomic_add(addr, ty, regs[value as usize]) };
                        }
                    }
                }
                pc += 1;
            }
        }
    }

    // ----------------------------------------------------------------
    // Flat serialization for the disk cache: 16 bytes per instruction.
    // ----------------------------------------------------------------

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.instrs.len() * 24);
        out.extend_from_slice(&self.n_regs.to_le_bytes());
        out.extend_from_slice(&(self.instrs.len() as u32).to_le_bytes());
        for instr in &self.instrs {
            let (tag, t0, t1, flag, dst, a, b, c, imm) = encode(instr);
            out.push(tag);
            out.push(t0);
            out.push(t1);
            out.push(flag);
            out.extend_from_slice(&dst.to_le_bytes());
            out.extend_from_slice(&a.to_le_bytes());
            out.extend_from_slice(&b.to_le_bytes());
            out.extend_from_slice(&c.to_le_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&imm.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<CpuProgram> {
        if bytes.len() < 8 {
            return None;
        }
        let n_regs = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let count = u32::from_le_bytes(bytes[4..8].try_into().ok()?) as usize;
        if bytes.len() != 8 + count * 24 {
            return None;
        }
        let mut instrs = Vec::with_capacity(count);
        for i in 0..count {
            let at = 8 + i * 24;
            let rec = &bytes[at..at + 24];
            let dst = u16::from_le_bytes(rec[4..6].try_into().ok()?);
            let a = u16::from_le_bytes(rec[6..8].try_into().ok()?);
            let b = u16::from_le_bytes(rec[8..10].try_into().ok()?);
            let c = u16::from_le_bytes(rec[10..12].try_into().ok()?);
            let imm = u64::from_le_bytes(rec[16..24].try_into().ok()?);
            instrs.push(decode(rec[0], rec[1], rec[2], rec[3], dst, a, b, c, imm)?);
        }
        Some(CpuProgram { instrs, n_regs })
    }
}

fn op_code(kind: OpKind) -> u8 {
    use OpKind::*;
    match kind {
        Counter => 0,
        Add => 1,
        Sub => 2,
        Mul => 3,
        Min => 4,
        Max => 5,
        And => 6,
        Or => 7,
        Xor => 8,
        Not => 9,
        Lt => 10,
        Le => 11,
        Gt => 12,
        Ge => 13,
        Eq => 14,
        Ne => 15,
        Select => 16,
        Cast => 17,
        ScatterAdd => 18,
        LoopPhi => 19,
        LoopStart => 20,
        LoopCond => 21,
        LoopBodyPhi => 22,
        LoopEnd => 23,
        LoopOut => 24,
    }
}

fn op_from_code(code: u8) -> Option<OpKind> {
    use OpKind::*;
    Some(match code {
        0 => Counter,
        1 => Add,
        2 => Sub,
        3 => Mul,
        4 => Min,
        5 => Max,
        6 => And,
        7 => Or,
        8 => Xor,
        9 => Not,
        10 => Lt,
        11 => Le,
        12 => Gt,
        13 => Ge,
        14 => Eq,
        15 => Ne,
        16 => Select,
        17 => Cast,
        18 => ScatterAdd,
        19 => LoopPhi,
        20 => LoopStart,
        21 => LoopCond,
        22 => LoopBodyPhi,
        23 => LoopEnd,
        24 => LoopOut,
        _ => return None,
    })
}

#[allow(clippy::type_complexity)]
fn encode(instr: &Instr) -> (u8, u8, u8, u8, u16, u16, u16, u16, u64) {
    match *instr {
        Instr::LoadParam { dst, slot } => (0, 0, 0, 0, dst, slot, 0, 0, 0),
        Instr::Load { dst, slot, ty, broadcast } => {
            (1, ty as u8, 0, broadcast as u8, dst, slot, 0, 0, 0)
        }
        Instr::Store { slot, src, ty } => (2, ty as u8, 0, 0, 0, slot, src, 0, 0),
        Instr::Imm { dst, value } => (3, 0, 0, 0, dst, 0, 0, 0, value),
        Instr::Counter { dst } => (4, 0, 0, 0, dst, 0, 0, 0, 0),
        Instr::Op2 { kind, ty, dst, a, b } => (5, ty as u8, op_code(kind), 0, dst, a, b, 0, 0),
        Instr::Select { dst, mask, a, b } => (6, 0, 0, 0, dst, mask, a, b, 0),
        Instr::Cast { dst, src, to, from } => (7, to as u8, from as u8, 0, dst, src, 0, 0, 0),
        Instr::Mov { dst, src } => (8, 0, 0, 0, dst, src, 0, 0, 0),
        Instr::Jump { target } => (9, 0, 0, 0, 0, 0, 0, 0, target as u64),
        Instr::JumpIfNot { mask, target } => (10, 0, 0, 0, 0, mask, 0, 0, target as u64),
        Instr::Scatter { ptr, index, value, mask, ty } => {
            (11, ty as u8, 0, 0, ptr, index, value, mask, 0)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn decode(
    tag: u8,
    t0: u8,
    t1: u8,
    flag: u8,
    dst: u16,
    a: u16,
    b: u16,
    c: u16,
    imm: u64,
) -> Option<Instr> {
    Some(match tag {
        0 => Instr::LoadParam { dst, slot: a },
        1 => Instr::Load {
            dst,
            slot: a,
            ty: VarType::from_code(t0)?,
            broadcast: flag != 0,
        },
        2 => Instr::Store { slot: a, src: b, ty: VarType::from_code(t0)? },
        3 => Instr::Imm { dst, value: imm },
        4 => Instr::Counter { dst },
        5 => Instr::Op2 {
            kind: op_from_code(t1)?,
            ty: VarType::from_code(t0)?,
            dst,
            a,
            b,
        },
        6 => Instr::Select { dst, mask: a, a: b, b: c },
        7 => Instr::Cast {
            dst,
            src: a,
            to: VarType::from_code(t0)?,
            from: VarType::from_code(t1)?,
        },
        8 => Instr::Mov { dst, src: a },
        9 => Instr::Jump { target: imm as u32 },
        10 => Instr::JumpIfNot { mask: a, target: imm as u32 },
        11 => Instr::Scatter {
            ptr: dst,
            index: a,
            value: b,
            mask: c,
            ty: VarType::from_code(t0)?,
        },
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_program() {
        // out[i] = a[i] + b[i]
        let program = CpuProgram {
            instrs: vec![
                Instr::Load { dst: 1, slot: 3, ty: VarType::U32, broadcast: false },
                Instr::Load { dst: 2, slot: 4, ty: VarType::U32, broadcast: false },
                Instr::Op2 { kind: OpKind::Add, ty: VarType::U32, dst: 3, a: 1, b: 2 },
                Instr::Store { slot: 5, src: 3, ty: VarType::U32 },
            ],
            n_regs: 4,
        };
        let a: Vec<u32> = (0..16).collect();
        let b: Vec<u32> = (0..16).map(|v| v * 10).collect();
        let mut out = vec![0u32; 16];
        let params = [
            0,
            0,
            0,
            a.as_ptr() as u64,
            b.as_ptr() as u64,
            out.as_mut_ptr() as u64,
        ];
        program.exec(0, 16, &params);
        assert_eq!(out, (0..16).map(|v| v * 11).collect::<Vec<u32>>());
    }

    #[test]
    fn serialization_round_trip() {
        let program = CpuProgram {
            instrs: vec![
                Instr::Counter { dst: 1 },
                Instr::Imm { dst: 2, value: 42 },
                Instr::Op2 { kind: OpKind::Add, ty: VarType::U32, dst: 3, a: 1, b: 2 },
                Instr::JumpIfNot { mask: 3, target: 1 },
                Instr::Scatter { ptr: 1, index: 2, value: 3, mask: 4, ty: VarType::F32 },
            ],
            n_regs: 5,
        };
        let bytes = program.to_bytes();
        let back = CpuProgram::from_bytes(&bytes).unwrap();
        assert_eq!(back.n_regs, 5);
        assert_eq!(back.instrs, program.instrs);
    }
}
