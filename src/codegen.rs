//! Kernel text assembly for both backends.
//!
//! The CUDA path emits a PTX module with a grid-stride prologue; the host
//! path emits an IR-style listing (the cache identity, also shown by
//! `PrintIR`) together with the bytecode program the task pool executes.
//! Kernel names are rendered as a 32-character `^` placeholder that the
//! evaluator overwrites in place with the content hash, so no offsets move.

use std::fmt::Write as _;

use crate::error::{raise, Error, Result};
use crate::op::OpKind;
use crate::state::State;
use crate::types::{Backend, VarType};
use crate::var::{self, ParamType, Stmt, Variable};
use crate::vm::{CpuProgram, Instr};

pub const NAME_PLACEHOLDER: &str = "^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^";
pub const KERNEL_PREFIX: &str = "smelt_";
pub const OPTIX_PREFIX: &str = "__raygen__";

/// Result of assembling one size group.
pub struct Assembly {
    pub text: String,
    /// Present on the host backend only.
    pub program: Option<CpuProgram>,
}

pub fn assemble(
    state: &State,
    backend: Backend,
    ids: &[u32],
    param_bytes: usize,
    staged: bool,
    uses_optix: bool,
    n_regs: u32,
) -> Result<Assembly> {
    match backend {
        Backend::Cuda => assemble_cuda(state, ids, param_bytes, staged, uses_optix, n_regs),
        Backend::Cpu => assemble_cpu(state, ids, n_regs),
    }
}

fn reg(v: &Variable) -> String {
    format!("{}{}", v.ty.reg_prefix(), v.reg_index)
}

fn dep<'a>(state: &'a State, v: &Variable, i: usize) -> &'a Variable {
    var::var(state, v.dep[i])
}

fn literal_imm(ty: VarType, bits: u64) -> String {
    match ty {
        VarType::F32 => format!("0f{:08X}", bits as u32),
        VarType::F64 => format!("0d{:016X}", bits),
        VarType::F16 => format!("0x{:04X}", bits as u16),
        t if t.is_signed() => {
            let v = match t.size() {
                1 => bits as u8 as i8 as i64,
                2 => bits as u16 as i16 as i64,
                4 => bits as u32 as i32 as i64,
                _ => bits as i64,
            };
            format!("{v}")
        }
        _ => format!("{bits}"),
    }
}

/// `selp` and register-to-register `mov` operand type.
fn ptx_bits(ty: VarType) -> &'static str {
    match ty.size() {
        1 | 2 => "b16",
        4 => {
            if ty == VarType::F32 {
                "f32"
            } else {
                "b32"
            }
        }
        _ => {
            if ty == VarType::F64 {
                "f64"
            } else {
                "b64"
            }
        }
    }
}

fn emit_literal_ptx(buf: &mut String, v: &Variable, bits: u64) {
    if v.ty == VarType::Bool {
        let _ = writeln!(buf, "    mov.u32 %r3, {};", (bits != 0) as u32);
        let _ = writeln!(buf, "    setp.ne.u32 {}, %r3, 0;", reg(v));
    } else if v.ty == VarType::F16 {
        let _ = writeln!(buf, "    mov.b16 {}, {};", reg(v), literal_imm(v.ty, bits));
    } else {
        let _ = writeln!(
            buf,
            "    mov.{} {}, {};",
            ptx_bits(v.ty),
            reg(v),
            literal_imm(v.ty, bits)
        );
    }
}

/// Load the parameter word at `offset` into the scratch address register.
fn param_addr(buf: &mut String, staged: bool, offset: u32) {
    if staged {
        let _ = writeln!(buf, "    ld.global.u64 %rd3, [%rd0+{offset}];");
    } else {
        let _ = writeln!(buf, "    ld.param.u64 %rd3, [params+{offset}];");
    }
}

fn emit_global_load(buf: &mut String, v: &Variable, addr: &str) {
    if v.ty == VarType::Bool {
        let _ = writeln!(buf, "    ld.global.u8 %w3, [{addr}];");
        let _ = writeln!(buf, "    setp.ne.u16 {}, %w3, 0;", reg(v));
    } else {
        let _ = writeln!(buf, "    ld.global.{} {}, [{addr}];", v.ty.ptx_mem(), reg(v));
    }
}

fn emit_global_store(buf: &mut String, v: &Variable) {
    if v.ty == VarType::Bool {
        let _ = writeln!(buf, "    selp.u16 %w3, 1, 0, {};", reg(v));
        let _ = writeln!(buf, "    st.global.u8 [%rd3], %w3;");
    } else {
        let _ = writeln!(buf, "    st.global.{} [%rd3], {};", v.ty.ptx_mem(), reg(v));
    }
}

fn cmp_name(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Lt => "lt",
        OpKind::Le => "le",
        OpKind::Gt => "gt",
        OpKind::Ge => "ge",
        OpKind::Eq => "eq",
        _ => "ne",
    }
}

fn emit_cast_ptx(buf: &mut String, v: &Variable, src: &Variable) -> Result<()> {
    let (dt, st) = (v.ty, src.ty);
    let d = reg(v);
    let a = reg(src);
    if st == VarType::Bool {
        let one = literal_imm(dt, crate::op::fold_cast(dt, VarType::U32, 1));
        let zero = literal_imm(dt, 0);
        let _ = writeln!(buf, "    selp.{} {}, {}, {}, {};", ptx_bits(dt), d, one, zero, a);
    } else if dt == VarType::Bool {
        let _ = writeln!(buf, "    setp.ne.{} {}, {}, 0;", st.ptx(), d, a);
    } else if st.is_float() && dt.is_float() {
        let round = if dt.size() < st.size() { "rn." } else { "" };
        let _ = writeln!(buf, "    cvt.{}{}.{} {}, {};", round, dt.ptx(), st.ptx(), d, a);
    } else if st.is_float() {
        let _ = writeln!(buf, "    cvt.rzi.{}.{} {}, {};", dt.ptx(), st.ptx(), d, a);
    } else if dt.is_float() {
        let _ = writeln!(buf, "    cvt.rn.{}.{} {}, {};", dt.ptx(), st.ptx(), d, a);
    } else {
        let _ = writeln!(buf, "    cvt.{}.{} {}, {};", dt.ptx(), st.ptx(), d, a);
    }
    Ok(())
}

/// Resolve the loop-start register a loop-cond or loop-end node refers to.
fn loop_start_reg(state: &State, cond: &Variable) -> u32 {
    dep(state, cond, 1).reg_index
}

fn emit_op_ptx(buf: &mut String, state: &State, id: u32, v: &Variable, kind: OpKind) -> Result<()> {
    let d = reg(v);
    match kind {
        OpKind::Counter => {
            let _ = writeln!(buf, "    mov.u32 {d}, %r0;");
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Min | OpKind::Max => {
            let a = dep(state, v, 0);
            let name = match kind {
                OpKind::Add => "add",
                OpKind::Sub => "sub",
                OpKind::Mul if a.ty.is_int() => "mul.lo",
                OpKind::Mul => "mul",
                OpKind::Min => "min",
                _ => "max",
            };
            let _ = writeln!(
                buf,
                "    {}.{} {}, {}, {};",
                name,
                a.ty.ptx(),
                d,
                reg(a),
                reg(dep(state, v, 1))
            );
        }
        OpKind::And | OpKind::Or | OpKind::Xor => {
            let a = dep(state, v, 0);
            let b = dep(state, v, 1);
            let name = match kind {
                OpKind::And => "and",
                OpKind::Or => "or",
                _ => "xor",
            };
            let t = if a.ty == VarType::Bool {
                "pred".to_string()
            } else {
                format!("b{}", a.ty.size() * 8)
            };
            let _ = writeln!(buf, "    {}.{} {}, {}, {};", name, t, d, reg(a), reg(b));
        }
        OpKind::Not => {
            let _ = writeln!(buf, "    not.pred {}, {};", d, reg(dep(state, v, 0)));
        }
        k if k.is_comparison() => {
            let a = dep(state, v, 0);
            let b = dep(state, v, 1);
            if a.ty == VarType::Bool {
                let _ = writeln!(buf, "    xor.pred {}, {}, {};", d, reg(a), reg(b));
                if k == OpKind::Eq {
                    let _ = writeln!(buf, "    not.pred {d}, {d};");
                }
            } else {
                let _ = writeln!(
                    buf,
                    "    setp.{}.{} {}, {}, {};",
                    cmp_name(k),
                    a.ty.ptx(),
                    d,
                    reg(a),
                    reg(b)
                );
            }
        }
        OpKind::Select => {
            let m = reg(dep(state, v, 0));
            let a = dep(state, v, 1);
            let b = dep(state, v, 2);
            if v.ty == VarType::Bool {
                let _ = writeln!(buf, "    and.pred %p3, {}, {};", m, reg(a));
                let _ = writeln!(buf, "    not.pred {d}, {m};");
                let _ = writeln!(buf, "    and.pred {}, {}, {};", d, d, reg(b));
                let _ = writeln!(buf, "    or.pred {d}, {d}, %p3;");
            } else {
                let _ = writeln!(
                    buf,
                    "    selp.{} {}, {}, {}, {};",
                    ptx_bits(v.ty),
                    d,
                    reg(a),
                    reg(b),
                    m
                );
            }
        }
        OpKind::Cast => emit_cast_ptx(buf, v, dep(state, v, 0))?,
        OpKind::ScatterAdd => {
            let ptr = dep(state, v, 0);
            let index = dep(state, v, 1);
            let value = dep(state, v, 2);
            let mask = dep(state, v, 3);
            let _ = writeln!(
                buf,
                "    mad.wide.u32 %rd3, {}, {}, {};",
                reg(index),
                value.ty.size(),
                reg(ptr)
            );
            let _ = writeln!(
                buf,
                "    @{} red.global.add.{} [%rd3], {};",
                reg(mask),
                value.ty.make_unsigned().ptx(),
                reg(value)
            );
        }
        OpKind::LoopPhi | OpKind::LoopBodyPhi => {
            let src = dep(state, v, 0);
            if v.ty == VarType::Bool {
                let _ = writeln!(buf, "    mov.pred {}, {};", d, reg(src));
            } else {
                let _ = writeln!(buf, "    mov.{} {}, {};", ptx_bits(v.ty), d, reg(src));
            }
        }
        OpKind::LoopStart => {
            let _ = writeln!(buf, "\nl_{}_start:", v.reg_index);
        }
        OpKind::LoopCond => {
            let mask = dep(state, v, 0);
            let _ = writeln!(
                buf,
                "    @!{} bra l_{}_done;",
                reg(mask),
                loop_start_reg(state, v)
            );
        }
        OpKind::LoopEnd => {
            let cond = dep(state, v, 0);
            let start_reg = loop_start_reg(state, cond);
            let info = state
                .extra
                .get(&id)
                .and_then(|e| e.loop_info.as_ref())
                .expect("loop end without loop info");
            for (&phi, &exit) in info.state.iter().zip(&info.body_exit) {
                let pv = var::var(state, phi);
                let ev = var::var(state, exit);
                if pv.reg_index == ev.reg_index {
                    continue;
                }
                if pv.ty == VarType::Bool {
                    let _ = writeln!(buf, "    mov.pred {}, {};", reg(pv), reg(ev));
                } else {
                    let _ = writeln!(buf, "    mov.{} {}, {};", ptx_bits(pv.ty), reg(pv), reg(ev));
                }
            }
            let _ = writeln!(buf, "    bra l_{start_reg}_start;");
            let _ = writeln!(buf, "\nl_{start_reg}_done:");
        }
        OpKind::LoopOut => {
            let src = dep(state, v, 0);
            if v.ty == VarType::Bool {
                let _ = writeln!(buf, "    mov.pred {}, {};", d, reg(src));
            } else {
                let _ = writeln!(buf, "    mov.{} {}, {};", ptx_bits(v.ty), d, reg(src));
            }
        }
        other => raise!("assemble(): cannot generate code for {other:?}"),
    }
    Ok(())
}

fn assemble_cuda(
    state: &State,
    ids: &[u32],
    param_bytes: usize,
    staged: bool,
    uses_optix: bool,
    n_regs: u32,
) -> Result<Assembly> {
    let mut top = String::new();
    let mut body = String::new();

    for &id in ids {
        let v = var::var(state, id);
        match v.param_type {
            ParamType::Input => {
                if v.ty == VarType::Ptr {
                    // The parameter word itself is the value.
                    if staged {
                        let _ = writeln!(top, "    ld.global.u64 {}, [%rd0+{}];", reg(v), v.param_offset);
                    } else {
                        let _ = writeln!(top, "    ld.param.u64 {}, [params+{}];", reg(v), v.param_offset);
                    }
                } else if v.size == 1 {
                    param_addr(&mut top, staged, v.param_offset);
                    emit_global_load(&mut top, v, "%rd3");
                } else {
                    param_addr(&mut body, staged, v.param_offset);
                    let _ = writeln!(
                        body,
                        "    mad.wide.u32 %rd3, %r0, {}, %rd3;",
                        v.ty.size()
                    );
                    emit_global_load(&mut body, v, "%rd3");
                }
            }
            ParamType::Output => {
                match v.stmt {
                    Stmt::Literal(bits) => emit_literal_ptx(&mut body, v, bits),
                    Stmt::Op(kind) => emit_op_ptx(&mut body, state, id, v, kind)?,
                    Stmt::None => panic!("r{id}: output without statement"),
                }
                param_addr(&mut body, staged, v.param_offset);
                let _ = writeln!(body, "    mad.wide.u32 %rd3, %r0, {}, %rd3;", v.ty.size());
                emit_global_store(&mut body, v);
            }
            ParamType::Register => match v.stmt {
                Stmt::Literal(bits) => emit_literal_ptx(&mut top, v, bits),
                Stmt::Op(kind) => emit_op_ptx(&mut body, state, id, v, kind)?,
                Stmt::None => panic!("r{id}: register variable without statement"),
            },
        }
    }

    let prefix = if uses_optix { OPTIX_PREFIX } else { KERNEL_PREFIX };
    let signature = if staged {
        ".param .u64 params".to_string()
    } else {
        format!(".param .align 8 .b8 params[{param_bytes}]")
    };
    let size_load = if staged {
        "    ld.param.u64 %rd0, [params];\n    ld.global.u32 %r2, [%rd0];"
    } else {
        "    ld.param.u32 %r2, [params];"
    };

    let mut text = String::with_capacity(top.len() + body.len() + 1024);
    let _ = write!(
        text,
        ".version 7.0\n.target sm_70\n.address_size 64\n\n\
.visible .entry {prefix}{NAME_PLACEHOLDER}({signature}) {{\n\
    .reg.pred %p<{n}>;\n    .reg.b16 %w<{n}>;\n    .reg.b32 %r<{n}>;\n\
    .reg.b64 %rd<{n}>;\n    .reg.f32 %f<{n}>;\n    .reg.f64 %d<{n}>;\n\n\
    mov.u32 %r0, %ctaid.x;\n\
    mov.u32 %r1, %ntid.x;\n\
    mov.u32 %r2, %tid.x;\n\
    mad.lo.u32 %r0, %r0, %r1, %r2;\n\
{size_load}\n\
    setp.ge.u32 %p0, %r0, %r2;\n\
    @%p0 bra l_done;\n\n\
    mov.u32 %r3, %nctaid.x;\n\
    mul.lo.u32 %r1, %r1, %r3;\n\n\
{top}\n\
l_body:\n\
{body}\n\
    add.u32 %r0, %r0, %r1;\n\
    setp.ge.u32 %p0, %r0, %r2;\n\
    @!%p0 bra l_body;\n\n\
l_done:\n\
    ret;\n\
}}\n",
        n = n_regs,
    );

    Ok(Assembly {
        text,
        program: None,
    })
}

// ====================================================================
// Host backend
// ====================================================================

struct CpuEmitter {
    listing: String,
    instrs: Vec<Instr>,
    /// Loop-start id -> bytecode label position.
    starts: Vec<(u32, u32)>,
    /// Loop-cond id -> index of its forward jump, patched by loop end.
    pending: Vec<(u32, usize)>,
}

impl CpuEmitter {
    fn r(&self, v: &Variable) -> u16 {
        v.reg_index as u16
    }
}

fn slot(v: &Variable) -> u16 {
    (v.param_offset / 8) as u16
}

fn emit_op_cpu(e: &mut CpuEmitter, state: &State, id: u32, v: &Variable, kind: OpKind) -> Result<()> {
    let d = e.r(v);
    match kind {
        OpKind::Counter => {
            let _ = writeln!(e.listing, "  %v{d} = counter i32");
            e.instrs.push(Instr::Counter { dst: d });
        }
        OpKind::Add
        | OpKind::Sub
        | OpKind::Mul
        | OpKind::Min
        | OpKind::Max
        | OpKind::And
        | OpKind::Or
        | OpKind::Xor
        | OpKind::Not
        | OpKind::Lt
        | OpKind::Le
        | OpKind::Gt
        | OpKind::Ge
        | OpKind::Eq
        | OpKind::Ne => {
            let a = dep(state, v, 0);
            let b = if v.dep[1] != 0 { dep(state, v, 1) } else { a };
            let _ = writeln!(
                e.listing,
                "  %v{} = {} {} %v{}, %v{}",
                d,
                format!("{kind:?}").to_lowercase(),
                a.ty.ir(),
                a.reg_index,
                b.reg_index
            );
            e.instrs.push(Instr::Op2 {
                kind,
                ty: a.ty,
                dst: d,
                a: a.reg_index as u16,
                b: b.reg_index as u16,
            });
        }
        OpKind::Select => {
            let m = dep(state, v, 0);
            let a = dep(state, v, 1);
            let b = dep(state, v, 2);
            let _ = writeln!(
                e.listing,
                "  %v{} = select i1 %v{}, {} %v{}, %v{}",
                d,
                m.reg_index,
                v.ty.ir(),
                a.reg_index,
                b.reg_index
            );
            e.instrs.push(Instr::Select {
                dst: d,
                mask: m.reg_index as u16,
                a: a.reg_index as u16,
                b: b.reg_index as u16,
            });
        }
        OpKind::Cast => {
            let a = dep(state, v, 0);
            let _ = writeln!(
                e.listing,
                "  %v{} = cast {} %v{} to {}",
                d,
                a.ty.ir(),
                a.reg_index,
                v.ty.ir()
            );
            e.instrs.push(Instr::Cast {
                dst: d,
                src: a.reg_index as u16,
                to: v.ty,
                from: a.ty,
            });
        }
        OpKind::ScatterAdd => {
            let ptr = dep(state, v, 0);
            let index = dep(state, v, 1);
            let value = dep(state, v, 2);
            let mask = dep(state, v, 3);
            if !matches!(value.ty.size(), 4 | 8) {
                return Err(Error::BackendCapability(format!(
                    "scatter_add(): no kernel for type={}",
                    value.ty.name()
                )));
            }
            let _ = writeln!(
                e.listing,
                "  scatter_add {} ptr %v{}, %v{}, %v{}, mask %v{}",
                value.ty.ir(),
                ptr.reg_index,
                index.reg_index,
                value.reg_index,
                mask.reg_index
            );
            e.instrs.push(Instr::Scatter {
                ptr: ptr.reg_index as u16,
                index: index.reg_index as u16,
                value: value.reg_index as u16,
                mask: mask.reg_index as u16,
                ty: value.ty,
            });
        }
        OpKind::LoopPhi | OpKind::LoopBodyPhi | OpKind::LoopOut => {
            let src = dep(state, v, 0);
            let _ = writeln!(
                e.listing,
                "  %v{} = mov {} %v{}",
                d,
                v.ty.ir(),
                src.reg_index
            );
            e.instrs.push(Instr::Mov {
                dst: d,
                src: src.reg_index as u16,
            });
        }
        OpKind::LoopStart => {
            let _ = writeln!(e.listing, "l{}_start:", v.reg_index);
            e.starts.push((id, e.instrs.len() as u32));
        }
        OpKind::LoopCond => {
            let mask = dep(state, v, 0);
            let _ = writeln!(
                e.listing,
                "  br_unless %v{}, l{}_done",
                mask.reg_index,
                loop_start_reg(state, v)
            );
            e.pending.push((id, e.instrs.len()));
            e.instrs.push(Instr::JumpIfNot {
                mask: mask.reg_index as u16,
                target: 0,
            });
        }
        OpKind::LoopEnd => {
            let cond_id = v.dep[0];
            let cond = dep(state, v, 0);
            let start_id = cond.dep[1];
            let start_reg = loop_start_reg(state, cond);
            let info = state
                .extra
                .get(&id)
                .and_then(|ex| ex.loop_info.as_ref())
                .expect("loop end without loop info");
            for (&phi, &exit) in info.state.iter().zip(&info.body_exit) {
                let pv = var::var(state, phi);
                let ev = var::var(state, exit);
                if pv.reg_index == ev.reg_index {
                    continue;
                }
                let _ = writeln!(
                    e.listing,
                    "  %v{} = mov {} %v{}",
                    pv.reg_index,
                    pv.ty.ir(),
                    ev.reg_index
                );
                e.instrs.push(Instr::Mov {
                    dst: pv.reg_index as u16,
                    src: ev.reg_index as u16,
                });
            }
            let _ = writeln!(e.listing, "  br l{start_reg}_start");
            let _ = writeln!(e.listing, "l{start_reg}_done:");
            let start_pc = e
                .starts
                .iter()
                .find(|(sid, _)| *sid == start_id)
                .map(|(_, pc)| *pc)
                .expect("loop start not yet emitted");
            e.instrs.push(Instr::Jump { target: start_pc });
            let here = e.instrs.len() as u32;
            if let Some(pos) = e.pending.iter().position(|(cid, _)| *cid == cond_id) {
                let (_, at) = e.pending.remove(pos);
                if let Instr::JumpIfNot { target, .. } = &mut e.instrs[at] {
                    *target = here;
                }
            }
        }
    }
    Ok(())
}

fn assemble_cpu(state: &State, ids: &[u32], n_regs: u32) -> Result<Assembly> {
    if n_regs > u16::MAX as u32 {
        raise!("assemble(): group uses too many registers ({n_regs})");
    }
    let mut e = CpuEmitter {
        listing: String::new(),
        instrs: Vec::new(),
        starts: Vec::new(),
        pending: Vec::new(),
    };

    for &id in ids {
        let v = var::var(state, id);
        let d = e.r(v);
        match v.param_type {
            ParamType::Input => {
                if v.ty == VarType::Ptr {
                    let _ = writeln!(e.listing, "  %v{} = param {}", d, slot(v));
                    e.instrs.push(Instr::LoadParam { dst: d, slot: slot(v) });
                } else {
                    let broadcast = v.size == 1;
                    let _ = writeln!(
                        e.listing,
                        "  %v{} = load {} param {}{}",
                        d,
                        v.ty.ir(),
                        slot(v),
                        if broadcast { " broadcast" } else { "" }
                    );
                    e.instrs.push(Instr::Load {
                        dst: d,
                        slot: slot(v),
                        ty: v.ty,
                        broadcast,
                    });
                }
            }
            ParamType::Output => {
                match v.stmt {
                    Stmt::Literal(bits) => {
                        let _ = writeln!(e.listing, "  %v{} = {} 0x{:x}", d, v.ty.ir(), bits);
                        e.instrs.push(Instr::Imm { dst: d, value: bits });
                    }
                    Stmt::Op(kind) => emit_op_cpu(&mut e, state, id, v, kind)?,
                    Stmt::None => panic!("r{id}: output without statement"),
                }
                let _ = writeln!(e.listing, "  store {} %v{}, param {}", v.ty.ir(), d, slot(v));
                e.instrs.push(Instr::Store {
                    slot: slot(v),
                    src: d,
                    ty: v.ty,
                });
            }
            ParamType::Register => match v.stmt {
                Stmt::Literal(bits) => {
                    let _ = writeln!(e.listing, "  %v{} = {} 0x{:x}", d, v.ty.ir(), bits);
                    e.instrs.push(Instr::Imm { dst: d, value: bits });
                }
                Stmt::Op(kind) => emit_op_cpu(&mut e, state, id, v, kind)?,
                Stmt::None => panic!("r{id}: register variable without statement"),
            },
        }
    }

    let mut text = String::with_capacity(e.listing.len() + 160);
    let _ = write!(
        text,
        "define void @{KERNEL_PREFIX}{NAME_PLACEHOLDER}(i32 %start, i32 %end, i8** %params)\n{{\n{}  ret void\n}}\n",
        e.listing
    );

    Ok(Assembly {
        text,
        program: Some(CpuProgram {
            instrs: e.instrs,
            n_regs,
        }),
    })
}

/// Overwrite the `^` placeholder with the hex content hash, in place.
pub fn rewrite_kernel_name(text: &mut String, hash: u128) {
    let Some(at) = text.find('^') else {
        panic!("assemble(): could not find kernel name placeholder");
    };
    let hex = format!("{hash:032x}");
    text.replace_range(at..at + 32, &hex);
}

/// 128-bit content hash of the kernel text.
pub fn hash_kernel(text: &str) -> u128 {
    xxhash_rust::xxh3::xxh3_128(text.as_bytes())
}
