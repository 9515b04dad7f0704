//! Computation-graph nodes, reference counting, and traced operations.
//!
//! A variable is addressed by a stable `u32` id. External references are
//! user holds (the `Var` handle), internal references are graph edges; a
//! variable dies when both reach zero. `ref_count_se` counts pending side
//! effects targeting an evaluated array ("dirty"); reading a dirty array
//! forces an evaluation first.

use tracing::trace;

use crate::backend;
use crate::error::{raise, Result};
use crate::extra::Extra;
use crate::memory::{self, AllocKind};
use crate::op::{self, OpKind};
use crate::state::{self, State};
use crate::types::{Backend, VarType};

/// Statement payload: at most one of literal, operation, or nothing (for
/// externally provided data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stmt {
    #[default]
    None,
    Literal(u64),
    Op(OpKind),
}

/// Role a variable plays in the kernel currently being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamType {
    #[default]
    Register,
    Input,
    Output,
}

/// Key identifying a pure expression for common-subexpression elimination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CseKey {
    pub op: Option<OpKind>,
    pub backend: Backend,
    pub ty: VarType,
    pub size: u32,
    pub dep: [u32; 4],
    pub literal: u64,
}

#[derive(Debug)]
pub struct Variable {
    pub backend: Backend,
    pub ty: VarType,
    pub size: u32,
    pub stmt: Stmt,
    /// Pointer to evaluated contents, zero until materialized.
    pub data: u64,
    pub dep: [u32; 4],
    pub ref_count_ext: u32,
    pub ref_count_int: u32,
    pub ref_count_se: u32,
    // Assembly-transient fields.
    pub param_offset: u32,
    pub param_type: ParamType,
    pub reg_index: u32,
    pub output_flag: bool,
    pub side_effect: bool,
    pub placeholder: bool,
    pub optix: bool,
    /// An `Extra` record exists for this id.
    pub extra: bool,
    /// Pointer literal through which an array is written; frees decrement
    /// the target's side-effect count.
    pub write_ptr: bool,
    pub cse_key: Option<CseKey>,
}

impl Variable {
    pub fn new(backend: Backend, ty: VarType, size: u32) -> Variable {
        Variable {
            backend,
            ty,
            size,
            stmt: Stmt::None,
            data: 0,
            dep: [0; 4],
            ref_count_ext: 1,
            ref_count_int: 0,
            ref_count_se: 0,
            param_offset: 0,
            param_type: ParamType::Register,
            reg_index: 0,
            output_flag: false,
            side_effect: false,
            placeholder: false,
            optix: false,
            extra: false,
            write_ptr: false,
            cse_key: None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.stmt, Stmt::Literal(_))
    }
}

pub fn var(state: &State, index: u32) -> &Variable {
    state
        .vars
        .get(&index)
        .unwrap_or_else(|| panic!("r{index}: unknown variable"))
}

pub fn var_mut(state: &mut State, index: u32) -> &mut Variable {
    state
        .vars
        .get_mut(&index)
        .unwrap_or_else(|| panic!("r{index}: unknown variable"))
}

// ====================================================================
// Reference counting
// ====================================================================

pub fn inc_ref_ext(state: &mut State, index: u32) {
    if index != 0 {
        var_mut(state, index).ref_count_ext += 1;
    }
}

pub fn inc_ref_int(state: &mut State, index: u32) {
    if index != 0 {
        var_mut(state, index).ref_count_int += 1;
    }
}

pub fn dec_ref_ext(state: &mut State, index: u32) {
    if index == 0 {
        return;
    }
    let v = var_mut(state, index);
    assert!(v.ref_count_ext > 0, "r{index}: ext refcount underflow");
    v.ref_count_ext -= 1;
    if v.ref_count_ext == 0 && v.ref_count_int == 0 {
        free_variable(state, index);
    }
}

pub fn dec_ref_int(state: &mut State, index: u32) {
    if index == 0 {
        return;
    }
    let v = var_mut(state, index);
    assert!(v.ref_count_int > 0, "r{index}: int refcount underflow");
    v.ref_count_int -= 1;
    if v.ref_count_ext == 0 && v.ref_count_int == 0 {
        free_variable(state, index);
    }
}

/// Remove a dead variable and release everything it holds. Iterative so a
/// long dependency chain cannot overflow the stack.
fn free_variable(state: &mut State, index: u32) {
    let mut queue = vec![index];
    while let Some(i) = queue.pop() {
        let Some(v) = state.vars.get(&i) else { continue };
        if v.ref_count_ext != 0 || v.ref_count_int != 0 {
            continue;
        }
        let v = state.vars.remove(&i).expect("variable just looked up");
        trace!(index = i, "free variable");

        if let Some(key) = v.cse_key {
            if state.cse.get(&key) == Some(&i) {
                state.cse.remove(&key);
            }
        }

        // A write-pointer going away clears the dirty mark on its target.
        if v.write_ptr {
            let target = v.dep[0];
            if let Some(t) = state.vars.get_mut(&target) {
                assert!(t.ref_count_se > 0, "r{target}: se refcount underflow");
                t.ref_count_se -= 1;
            }
        }

        if v.data != 0 {
            memory::free(state, v.data);
        }

        for d in v.dep {
            if d == 0 {
                continue;
            }
            let dv = var_mut(state, d);
            assert!(dv.ref_count_int > 0, "r{d}: int refcount underflow");
            dv.ref_count_int -= 1;
            if dv.ref_count_ext == 0 && dv.ref_count_int == 0 {
                queue.push(d);
            }
        }

        if v.extra {
            if let Some(mut ex) = state.extra.remove(&i) {
                if let Some(cb) = ex.callback.as_mut() {
                    cb(i, true);
                }
                for d in ex.dep {
                    if d == 0 {
                        continue;
                    }
                    let dv = var_mut(state, d);
                    assert!(dv.ref_count_int > 0, "r{d}: int refcount underflow");
                    dv.ref_count_int -= 1;
                    if dv.ref_count_ext == 0 && dv.ref_count_int == 0 {
                        queue.push(d);
                    }
                }
            }
        }
    }
}

// ====================================================================
// Node construction
// ====================================================================

/// Insert a fresh variable, taking internal references on its dependencies.
/// The returned id carries one external reference.
pub fn new_var(state: &mut State, v: Variable) -> u32 {
    state.var_counter += 1;
    let index = state.var_counter;
    for d in v.dep {
        inc_ref_int(state, d);
    }
    if let Some(key) = v.cse_key {
        state.cse.insert(key, index);
    }
    state.vars.insert(index, v);
    index
}

/// Attach an extra record; deps listed there are internally referenced.
pub fn attach_extra(state: &mut State, index: u32, extra: Extra) {
    for &d in &extra.dep {
        inc_ref_int(state, d);
    }
    var_mut(state, index).extra = true;
    state.extra.insert(index, extra);
}

fn literal_in(state: &mut State, backend: Backend, ty: VarType, value: u64, size: u32) -> u32 {
    let key = CseKey {
        op: None,
        backend,
        ty,
        size,
        dep: [0; 4],
        literal: value,
    };
    if let Some(&existing) = state.cse.get(&key) {
        inc_ref_ext(state, existing);
        return existing;
    }
    let mut v = Variable::new(backend, ty, size);
    v.stmt = Stmt::Literal(value);
    v.cse_key = Some(key);
    new_var(state, v)
}

fn new_op_in(
    state: &mut State,
    backend: Backend,
    kind: OpKind,
    ty: VarType,
    size: u32,
    dep: [u32; 4],
) -> u32 {
    let key = if kind.is_pure() {
        let key = CseKey {
            op: Some(kind),
            backend,
            ty,
            size,
            dep,
            literal: 0,
        };
        if let Some(&existing) = state.cse.get(&key) {
            inc_ref_ext(state, existing);
            return existing;
        }
        Some(key)
    } else {
        None
    };
    let mut v = Variable::new(backend, ty, size);
    v.stmt = Stmt::Op(kind);
    v.dep = dep;
    v.cse_key = key;
    new_var(state, v)
}

/// Literal constant, broadcast to `size` lanes.
pub fn literal(backend: Backend, ty: VarType, value: u64, size: u32) -> Result<u32> {
    if size == 0 {
        raise!("literal(): size cannot be zero");
    }
    let mut st = state::lock();
    Ok(literal_in(&mut st, backend, ty, value, size))
}

/// Lane index 0..size as `u32`.
pub fn counter(backend: Backend, size: u32) -> Result<u32> {
    if size == 0 {
        raise!("counter(): size cannot be zero");
    }
    let mut st = state::lock();
    Ok(new_op_in(
        &mut st,
        backend,
        OpKind::Counter,
        VarType::U32,
        size,
        [0; 4],
    ))
}

fn broadcast_size(a: u32, b: u32) -> Option<u32> {
    if a == b || b == 1 {
        Some(a)
    } else if a == 1 {
        Some(b)
    } else {
        None
    }
}

fn check_binary(kind: OpKind, ty: VarType) -> bool {
    match kind {
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Min | OpKind::Max => {
            ty.is_int() || ty.is_float()
        }
        OpKind::And | OpKind::Or | OpKind::Xor => ty.is_int() || ty == VarType::Bool,
        OpKind::Eq | OpKind::Ne => ty.is_int() || ty.is_float() || ty == VarType::Bool,
        OpKind::Lt | OpKind::Le | OpKind::Gt | OpKind::Ge => ty.is_int() || ty.is_float(),
        _ => false,
    }
}

/// Binary operation with scalar broadcasting.
pub fn binary(kind: OpKind, a: u32, b: u32) -> Result<u32> {
    let mut st = state::lock();
    let (backend, ty, size_a, stmt_a) = {
        let v = var(&st, a);
        (v.backend, v.ty, v.size, v.stmt)
    };
    let (ty_b, size_b, stmt_b, backend_b) = {
        let v = var(&st, b);
        (v.ty, v.size, v.stmt, v.backend)
    };
    if backend != backend_b {
        raise!("binary(): operands r{a} and r{b} live on different backends");
    }
    if ty != ty_b {
        raise!(
            "binary(): operands r{a} ({}) and r{b} ({}) have different types",
            ty.name(),
            ty_b.name()
        );
    }
    if !check_binary(kind, ty) {
        raise!("binary(): {:?} is not defined for type {}", kind, ty.name());
    }
    let Some(size) = broadcast_size(size_a, size_b) else {
        raise!("binary(): incompatible sizes {size_a} and {size_b}");
    };
    let rty = if kind.is_comparison() { VarType::Bool } else { ty };

    if let (Stmt::Literal(x), Stmt::Literal(y)) = (stmt_a, stmt_b) {
        if let Some(bits) = op::fold(kind, ty, &[x, y]) {
            return Ok(literal_in(&mut st, backend, rty, bits, size));
        }
    }
    Ok(new_op_in(&mut st, backend, kind, rty, size, [a, b, 0, 0]))
}

/// Boolean negation.
pub fn not(a: u32) -> Result<u32> {
    let mut st = state::lock();
    let (backend, ty, size, stmt) = {
        let v = var(&st, a);
        (v.backend, v.ty, v.size, v.stmt)
    };
    if ty != VarType::Bool {
        raise!("not(): expected a boolean operand, got {}", ty.name());
    }
    if let Stmt::Literal(x) = stmt {
        return Ok(literal_in(&mut st, backend, ty, (x == 0) as u64, size));
    }
    Ok(new_op_in(&mut st, backend, OpKind::Not, ty, size, [a, 0, 0, 0]))
}

/// `mask ? t : f` per lane.
pub fn select(mask: u32, t: u32, f: u32) -> Result<u32> {
    let mut st = state::lock();
    let (backend, mask_ty, mask_size, mask_stmt) = {
        let v = var(&st, mask);
        (v.backend, v.ty, v.size, v.stmt)
    };
    let (ty_t, size_t) = {
        let v = var(&st, t);
        (v.ty, v.size)
    };
    let (ty_f, size_f) = {
        let v = var(&st, f);
        (v.ty, v.size)
    };
    if mask_ty != VarType::Bool {
        raise!("select(): mask must be boolean, got {}", mask_ty.name());
    }
    if ty_t != ty_f {
        raise!(
            "select(): branch types {} and {} differ",
            ty_t.name(),
            ty_f.name()
        );
    }
    let size = broadcast_size(size_t, size_f)
        .and_then(|s| broadcast_size(s, mask_size))
        .ok_or_else(|| {
            crate::error::Error::InvalidInput(format!(
                "select(): incompatible sizes {mask_size}, {size_t}, {size_f}"
            ))
        })?;
    if let Stmt::Literal(m) = mask_stmt {
        let chosen = if m != 0 { t } else { f };
        inc_ref_ext(&mut st, chosen);
        return Ok(chosen);
    }
    Ok(new_op_in(
        &mut st,
        backend,
        OpKind::Select,
        ty_t,
        size,
        [mask, t, f, 0],
    ))
}

/// Numeric conversion.
pub fn cast(a: u32, dst: VarType) -> Result<u32> {
    let mut st = state::lock();
    let (backend, src, size, stmt) = {
        let v = var(&st, a);
        (v.backend, v.ty, v.size, v.stmt)
    };
    if !(src.is_int() || src.is_float() || src == VarType::Bool)
        || !(dst.is_int() || dst.is_float())
    {
        raise!("cast(): unsupported conversion {} -> {}", src.name(), dst.name());
    }
    if src == dst {
        inc_ref_ext(&mut st, a);
        return Ok(a);
    }
    if let Stmt::Literal(x) = stmt {
        let bits = op::fold_cast(dst, src, x);
        return Ok(literal_in(&mut st, backend, dst, bits, size));
    }
    Ok(new_op_in(&mut st, backend, OpKind::Cast, dst, size, [a, 0, 0, 0]))
}

/// Masked `target[index] += value`, deferred until the next evaluation.
///
/// The target must already be evaluated; it is marked dirty until the
/// scatter has run, and reads through `read_bytes` force that evaluation.
pub fn scatter_add(target: u32, value: u32, index: u32, mask: Option<u32>) -> Result<()> {
    let (backend, ptr_var, dep_index, dep_value, size) = {
        let mut st = state::lock();
        let (backend, ty, data) = {
            let v = var(&st, target);
            (v.backend, v.ty, v.data)
        };
        if data == 0 {
            raise!("scatter_add(): target r{target} must be evaluated first");
        }
        let (ty_v, size_v) = {
            let v = var(&st, value);
            (v.ty, v.size)
        };
        let (ty_i, size_i) = {
            let v = var(&st, index);
            (v.ty, v.size)
        };
        if ty_v != ty {
            raise!(
                "scatter_add(): value type {} does not match target type {}",
                ty_v.name(),
                ty.name()
            );
        }
        if ty_i != VarType::U32 {
            raise!("scatter_add(): index must be u32, got {}", ty_i.name());
        }
        let Some(size) = broadcast_size(size_v, size_i) else {
            raise!("scatter_add(): incompatible sizes {size_v} and {size_i}");
        };

        // Write-pointer node keeps the target alive and dirty.
        let mut pv = Variable::new(backend, VarType::Ptr, 1);
        pv.stmt = Stmt::Literal(data);
        pv.dep[0] = target;
        pv.write_ptr = true;
        let ptr_var = new_var(&mut st, pv);
        var_mut(&mut st, target).ref_count_se += 1;
        (backend, ptr_var, index, value, size)
    };

    state::with_ts(backend, |ts| {
        let mask = match (mask, ts.mask_stack.last().copied()) {
            (Some(m), Some(top)) => binary(OpKind::And, m, top)?,
            (Some(m), None) => {
                let mut st = state::lock();
                inc_ref_ext(&mut st, m);
                m
            }
            (None, Some(top)) => {
                let mut st = state::lock();
                inc_ref_ext(&mut st, top);
                top
            }
            (None, None) => literal(backend, VarType::Bool, 1, 1)?,
        };

        let mut st = state::lock();
        let size = broadcast_size(size, var(&st, mask).size).ok_or_else(|| {
            crate::error::Error::InvalidInput(
                "scatter_add(): mask size incompatible with operands".to_string(),
            )
        })?;
        let mut v = Variable::new(backend, VarType::Void, size);
        v.stmt = Stmt::Op(OpKind::ScatterAdd);
        v.dep = [ptr_var, dep_index, dep_value, mask];
        v.side_effect = true;
        let se = new_var(&mut st, v);
        // The pending-side-effect list owns the reference created above;
        // the temporaries borrowed here are released again.
        dec_ref_ext(&mut st, ptr_var);
        dec_ref_ext(&mut st, mask);
        ts.side_effects.push(se);
        trace!(se, target, "scatter_add recorded");
        Ok(())
    })
}

/// Interpose a placeholder standing for a yet-unresolved loop value.
pub fn placeholder(src: u32, body: bool) -> Result<u32> {
    let mut st = state::lock();
    let (backend, ty, size) = {
        let v = var(&st, src);
        (v.backend, v.ty, v.size)
    };
    if ty == VarType::Void {
        raise!("placeholder(): cannot interpose a void variable");
    }
    let kind = if body { OpKind::LoopBodyPhi } else { OpKind::LoopPhi };
    let mut v = Variable::new(backend, ty, size);
    v.stmt = Stmt::Op(kind);
    v.dep[0] = src;
    v.placeholder = true;
    Ok(new_var(&mut st, v))
}

// ====================================================================
// Data movement
// ====================================================================

/// Upload raw bytes and wrap them in an evaluated variable.
pub fn array_from_bytes(backend: Backend, ty: VarType, size: u32, bytes: &[u8]) -> Result<u32> {
    if size == 0 {
        raise!("array_from_bytes(): size cannot be zero");
    }
    assert_eq!(bytes.len(), size as usize * ty.size(), "payload size mismatch");
    state::with_ts(backend, |ts| {
        let kind = match backend {
            Backend::Cpu => AllocKind::HostAsync,
            Backend::Cuda => AllocKind::Device,
        };
        let ptr = {
            let mut st = state::lock();
            memory::malloc(&mut st, kind, bytes.len())?
        };
        backend::memcpy(ts, ptr, bytes.as_ptr() as u64, bytes.len())?;
        let mut st = state::lock();
        let mut v = Variable::new(backend, ty, size);
        v.data = ptr;
        Ok(new_var(&mut st, v))
    })
}

/// Mark a variable for evaluation on the next `eval`.
pub fn schedule(index: u32) -> Result<()> {
    let backend = {
        let st = state::lock();
        let v = var(&st, index);
        if v.data != 0 && v.ref_count_se == 0 {
            return Ok(());
        }
        v.backend
    };
    state::with_ts(backend, |ts| {
        ts.scheduled.push(index);
        Ok(())
    })
}

/// Copy a variable's contents back to the host, evaluating it if needed.
pub fn read_bytes(index: u32) -> Result<Vec<u8>> {
    let (backend, needs_eval) = {
        let st = state::lock();
        let v = var(&st, index);
        (v.backend, v.data == 0 || v.ref_count_se > 0)
    };
    if needs_eval {
        schedule(index)?;
        crate::eval(backend)?;
    }
    let (src, nbytes) = {
        let st = state::lock();
        let v = var(&st, index);
        if v.data == 0 {
            raise!("read_bytes(): variable r{index} has no data after evaluation");
        }
        (v.data, v.size as usize * v.ty.size())
    };
    let mut out = vec![0u8; nbytes];
    state::with_ts(backend, |ts| {
        backend::memcpy(ts, out.as_mut_ptr() as u64, src, nbytes)
    })?;
    Ok(out)
}

// ====================================================================
// Public handle
// ====================================================================

/// Owning handle to a graph variable. Cloning takes another external
/// reference; dropping releases one.
#[derive(Debug)]
pub struct Var {
    index: u32,
}

impl Var {
    /// Wrap an id that already carries one external reference.
    pub(crate) fn steal(index: u32) -> Var {
        Var { index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Replace the underlying id without touching reference counts. The
    /// caller is responsible for the old id's reference.
    pub(crate) fn set_index_raw(&mut self, index: u32) {
        self.index = index;
    }

    pub fn counter(backend: Backend, size: u32) -> Result<Var> {
        Ok(Var::steal(counter(backend, size)?))
    }

    pub fn literal_u32(backend: Backend, value: u32, size: u32) -> Result<Var> {
        Ok(Var::steal(literal(backend, VarType::U32, value as u64, size)?))
    }

    pub fn literal_f32(backend: Backend, value: f32, size: u32) -> Result<Var> {
        Ok(Var::steal(literal(
            backend,
            VarType::F32,
            value.to_bits() as u64,
            size,
        )?))
    }

    pub fn literal_bool(backend: Backend, value: bool, size: u32) -> Result<Var> {
        Ok(Var::steal(literal(backend, VarType::Bool, value as u64, size)?))
    }

    pub fn from_u32_slice(backend: Backend, values: &[u32]) -> Result<Var> {
        Ok(Var::steal(array_from_bytes(
            backend,
            VarType::U32,
            values.len() as u32,
            bytemuck::cast_slice(values),
        )?))
    }

    pub fn from_f32_slice(backend: Backend, values: &[f32]) -> Result<Var> {
        Ok(Var::steal(array_from_bytes(
            backend,
            VarType::F32,
            values.len() as u32,
            bytemuck::cast_slice(values),
        )?))
    }

    pub fn ty(&self) -> VarType {
        let st = state::lock();
        var(&st, self.index).ty
    }

    pub fn size(&self) -> u32 {
        let st = state::lock();
        var(&st, self.index).size
    }

    pub fn backend(&self) -> Backend {
        let st = state::lock();
        var(&st, self.index).backend
    }

    fn bin(&self, kind: OpKind, other: &Var) -> Result<Var> {
        Ok(Var::steal(binary(kind, self.index, other.index)?))
    }

    pub fn add(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Add, other)
    }

    pub fn sub(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Sub, other)
    }

    pub fn mul(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Mul, other)
    }

    pub fn min(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Min, other)
    }

    pub fn max(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Max, other)
    }

    pub fn and(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::And, other)
    }

    pub fn or(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Or, other)
    }

    pub fn lt(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Lt, other)
    }

    pub fn le(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Le, other)
    }

    pub fn gt(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Gt, other)
    }

    pub fn ge(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Ge, other)
    }

    pub fn eq_(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Eq, other)
    }

    pub fn ne(&self, other: &Var) -> Result<Var> {
        self.bin(OpKind::Ne, other)
    }

    pub fn not(&self) -> Result<Var> {
        Ok(Var::steal(not(self.index)?))
    }

    pub fn select(mask: &Var, t: &Var, f: &Var) -> Result<Var> {
        Ok(Var::steal(select(mask.index, t.index, f.index)?))
    }

    pub fn cast(&self, ty: VarType) -> Result<Var> {
        Ok(Var::steal(cast(self.index, ty)?))
    }

    /// `target[index] += value` under the ambient (and optional explicit) mask.
    pub fn scatter_add(target: &Var, value: &Var, index: &Var, mask: Option<&Var>) -> Result<()> {
        scatter_add(target.index, value.index, index.index, mask.map(|m| m.index))
    }

    pub fn schedule(&self) -> Result<()> {
        schedule(self.index)
    }

    pub fn to_vec_u32(&self) -> Result<Vec<u32>> {
        Ok(bytemuck::cast_slice(&read_bytes(self.index)?).to_vec())
    }

    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        Ok(bytemuck::cast_slice(&read_bytes(self.index)?).to_vec())
    }

    pub fn to_vec_bool(&self) -> Result<Vec<bool>> {
        Ok(read_bytes(self.index)?.into_iter().map(|b| b != 0).collect())
    }
}

impl Clone for Var {
    fn clone(&self) -> Var {
        let mut st = state::lock();
        inc_ref_ext(&mut st, self.index);
        Var { index: self.index }
    }
}

impl Drop for Var {
    fn drop(&mut self) {
        if self.index != 0 {
            let mut st = state::lock();
            dec_ref_ext(&mut st, self.index);
        }
    }
}
