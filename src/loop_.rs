//! Recorded and wavefront loops.
//!
//! ```ignore
//! let mut l = Loop::new("count", &mut [&mut x, &mut y])?;
//! loop {
//!     let m = x.lt(&limit)?;
//!     if !l.cond(&m, &mut [&mut x, &mut y])? {
//!         break;
//!     }
//!     y = y.add(&x)?;
//!     x = x.add(&one)?;
//! }
//! ```
//!
//! With `LoopRecord` set, the builder interposes placeholders over the loop
//! variables, lets the body trace exactly once against them, and closes the
//! construct into loop nodes that the evaluator emits as a single in-kernel
//! loop. Otherwise each `cond` call evaluates the pending trace and uses the
//! mask to disable finished lanes (wavefront mode), one kernel per
//! iteration. On integer data both modes produce bitwise-equal results.
//!
//! Variables must be passed to every call in the same order. If the builder
//! is dropped mid-recording (e.g. because the body raised an error), side
//! effects recorded past the entry watermark are rolled back and the flag
//! state is restored.

use tracing::{debug, warn};

use crate::error::{raise, Result};
use crate::extra::{Extra, LoopInfo};
use crate::op::OpKind;
use crate::state::{self, flag, set_flag, JitFlag};
use crate::types::{Backend, VarType};
use crate::var::{self, Var, Variable};

pub struct Loop {
    name: String,
    backend: Backend,
    size: u32,
    record: bool,
    /// 0 = open, 1 = initialized, 2 = body recording, 3 = closed.
    state: u32,
    /// Side-effect watermark for rollback; disarmed once the loop closes.
    se_offset: Option<usize>,
    se_flag: bool,
    rec_flag: bool,
    /// Recording mode: state placeholders, loop-start/cond ids, saved mask.
    phi: Vec<u32>,
    loop_start: u32,
    loop_cond: u32,
    cond_index: u32,
    /// Wavefront mode: previous iteration's mask and variable snapshot.
    wav_cond: u32,
    wav_out: Vec<u32>,
}

impl Loop {
    /// Snapshot the loop variables and, when recording, interpose
    /// placeholders over them.
    pub fn new(name: &str, vars: &mut [&mut Var]) -> Result<Loop> {
        if vars.is_empty() {
            raise!("Loop(): at least one loop variable is required");
        }
        let (backend, size) = {
            let st = state::lock();
            let mut size = 0u32;
            let mut backend = None;
            for v in vars.iter() {
                let vv = var::var(&st, v.index());
                if vv.ty == VarType::Void {
                    raise!("Loop(): void variables cannot be loop state");
                }
                if let Some(b) = backend {
                    if b != vv.backend {
                        raise!("Loop(): loop variables live on different backends");
                    }
                } else {
                    backend = Some(vv.backend);
                }
                if size != 0 && vv.size != 1 && vv.size != size && size != 1 {
                    raise!("Loop(): loop variables have inconsistent sizes");
                }
                size = size.max(vv.size);
            }
            (backend.expect("at least one variable"), size)
        };

        let record = flag(JitFlag::LoopRecord);
        let mut l = Loop {
            name: name.to_string(),
            backend,
            size,
            record,
            state: 0,
            se_offset: None,
            se_flag: false,
            rec_flag: false,
            phi: Vec::with_capacity(vars.len()),
            loop_start: 0,
            loop_cond: 0,
            cond_index: 0,
            wav_cond: 0,
            wav_out: Vec::new(),
        };
        if record {
            l.init(vars)?;
        }
        debug!(name, size, record, "loop created");
        Ok(l)
    }

    fn init(&mut self, vars: &mut [&mut Var]) -> Result<()> {
        self.step(vars, false)?;
        self.phi = vars.iter().map(|v| v.index()).collect();

        // The loop head label sits between the state placeholders and the
        // user's condition so the back edge re-evaluates the mask.
        {
            let mut st = state::lock();
            let mut v = Variable::new(self.backend, VarType::Void, self.size);
            v.stmt = crate::var::Stmt::Op(OpKind::LoopStart);
            let start = var::new_var(&mut st, v);
            var::attach_extra(
                &mut st,
                start,
                Extra {
                    dep: self.phi.clone(),
                    ..Extra::default()
                },
            );
            self.loop_start = start;
        }

        self.se_offset = Some(state::with_ts(self.backend, |ts| Ok(ts.side_effects.len()))?);
        self.se_flag = flag(JitFlag::PostponeSideEffects);
        self.rec_flag = flag(JitFlag::Recording);
        set_flag(JitFlag::PostponeSideEffects, true);
        set_flag(JitFlag::Recording, true);
        self.state = 1;
        Ok(())
    }

    /// Interpose fresh placeholders over every variable slot.
    fn step(&self, vars: &mut [&mut Var], body: bool) -> Result<()> {
        for v in vars.iter_mut() {
            let old = v.index();
            let next = var::placeholder(old, body)?;
            {
                let mut st = state::lock();
                var::dec_ref_ext(&mut st, old);
            }
            v.set_index_raw(next);
        }
        Ok(())
    }

    /// Returns true while the body should run (again).
    pub fn cond(&mut self, mask: &Var, vars: &mut [&mut Var]) -> Result<bool> {
        if self.record && vars.len() != self.phi.len() {
            raise!("Loop.cond(): inconsistent number of loop variables");
        }
        if self.record {
            self.cond_record(mask, vars)
        } else {
            self.cond_wavefront(mask, vars)
        }
    }

    fn cond_record(&mut self, mask: &Var, vars: &mut [&mut Var]) -> Result<bool> {
        match self.state {
            1 => {
                self.state = 2;
                self.cond_index = mask.index();
                {
                    let mut st = state::lock();
                    var::inc_ref_ext(&mut st, self.cond_index);

                    let mut v = Variable::new(self.backend, VarType::Void, self.size);
                    v.stmt = crate::var::Stmt::Op(OpKind::LoopCond);
                    v.dep = [self.cond_index, self.loop_start, 0, 0];
                    self.loop_cond = var::new_var(&mut st, v);
                }
                // Scatters recorded in the body conjoin with the loop mask.
                state::with_ts(self.backend, |ts| {
                    ts.mask_stack.push(self.cond_index);
                    Ok(())
                })?;
                self.step(vars, true)?;
                debug!(name = %self.name, "loop body recording");
                Ok(true)
            }
            2 => {
                self.state = 3;
                let body_exit: Vec<u32> = vars.iter().map(|v| v.index()).collect();

                state::with_ts(self.backend, |ts| {
                    ts.mask_stack.pop();

                    // Side effects past the watermark belong to the loop.
                    let watermark = self.se_offset.unwrap_or(0);
                    let attached: Vec<u32> = ts.side_effects.split_off(watermark);

                    let mut st = state::lock();
                    let mut v = Variable::new(self.backend, VarType::Void, self.size);
                    v.stmt = crate::var::Stmt::Op(OpKind::LoopEnd);
                    v.dep = [self.loop_cond, 0, 0, 0];
                    v.side_effect = true;
                    let end = var::new_var(&mut st, v);

                    let mut aux = body_exit.clone();
                    aux.extend_from_slice(&attached);
                    var::attach_extra(
                        &mut st,
                        end,
                        Extra {
                            dep: aux,
                            loop_info: Some(LoopInfo {
                                state: self.phi.clone(),
                                body_exit: body_exit.clone(),
                            }),
                            ..Extra::default()
                        },
                    );

                    // The loop node now owns the attached side effects; they
                    // are released together with it rather than by cleanup.
                    for se in attached {
                        var::var_mut(&mut st, se).side_effect = false;
                        var::dec_ref_ext(&mut st, se);
                    }

                    // Per-variable results; these replace the caller's ids.
                    for (slot, &phi) in vars.iter_mut().zip(&self.phi) {
                        let ty = var::var(&st, phi).ty;
                        let mut v = Variable::new(self.backend, ty, self.size);
                        v.stmt = crate::var::Stmt::Op(OpKind::LoopOut);
                        v.dep = [phi, end, 0, 0];
                        let out = var::new_var(&mut st, v);
                        var::dec_ref_ext(&mut st, slot.index());
                        slot.set_index_raw(out);
                        ts.scheduled.push(out);
                    }

                    // The pending list owns the loop node's reference.
                    ts.side_effects.push(end);

                    var::dec_ref_ext(&mut st, self.cond_index);
                    var::dec_ref_ext(&mut st, self.loop_start);
                    var::dec_ref_ext(&mut st, self.loop_cond);
                    Ok(())
                })?;

                set_flag(JitFlag::PostponeSideEffects, self.se_flag);
                set_flag(JitFlag::Recording, self.rec_flag);
                self.se_offset = None;
                debug!(name = %self.name, vars = self.phi.len(), "loop recorded");
                Ok(false)
            }
            0 => raise!("Loop(): must be initialized first"),
            _ => raise!("Loop(): invalid state (cond() must run exactly twice)"),
        }
    }

    fn cond_wavefront(&mut self, mask: &Var, vars: &mut [&mut Var]) -> Result<bool> {
        // Merge the previous iteration's results: disabled lanes keep their
        // old value.
        if self.wav_cond != 0 {
            for (slot, &old) in vars.iter_mut().zip(&self.wav_out) {
                let current = slot.index();
                let merged = var::select(self.wav_cond, current, old)?;
                let mut st = state::lock();
                var::dec_ref_ext(&mut st, current);
                var::dec_ref_ext(&mut st, old);
                slot.set_index_raw(merged);
            }
            state::with_ts(self.backend, |ts| {
                ts.mask_stack.pop();
                Ok(())
            })?;
            {
                let mut st = state::lock();
                var::dec_ref_ext(&mut st, self.wav_cond);
            }
            self.wav_cond = 0;
            self.wav_out.clear();
        }

        // Evaluate the mask together with all loop state.
        var::schedule(mask.index())?;
        for v in vars.iter() {
            var::schedule(v.index())?;
        }
        crate::eval(self.backend)?;

        if var_any(mask.index())? {
            self.wav_cond = mask.index();
            {
                let mut st = state::lock();
                var::inc_ref_ext(&mut st, self.wav_cond);
                for v in vars.iter() {
                    var::inc_ref_ext(&mut st, v.index());
                    self.wav_out.push(v.index());
                }
            }
            state::with_ts(self.backend, |ts| {
                ts.mask_stack.push(self.wav_cond);
                Ok(())
            })?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// True when any lane of an evaluated boolean variable is set.
fn var_any(index: u32) -> Result<bool> {
    let (backend, data, size, stmt) = {
        let st = state::lock();
        let v = var::var(&st, index);
        (v.backend, v.data, v.size, v.stmt)
    };
    if let crate::var::Stmt::Literal(value) = stmt {
        return Ok(value != 0);
    }
    if data == 0 {
        raise!("any(): variable r{index} is not evaluated");
    }
    crate::reduce::any(backend, data, size)
}

impl Drop for Loop {
    fn drop(&mut self) {
        if self.record {
            if let Some(watermark) = self.se_offset {
                // Recording was aborted; roll the side effects back.
                let _ = state::with_ts(self.backend, |ts| {
                    let rolled: Vec<u32> = ts.side_effects.split_off(watermark);
                    let mut st = state::lock();
                    for se in rolled {
                        var::dec_ref_ext(&mut st, se);
                    }
                    if self.state >= 2 {
                        ts.mask_stack.pop();
                    }
                    Ok(())
                });
                set_flag(JitFlag::PostponeSideEffects, self.se_flag);
                set_flag(JitFlag::Recording, self.rec_flag);
                let mut st = state::lock();
                var::dec_ref_ext(&mut st, self.cond_index);
                var::dec_ref_ext(&mut st, self.loop_start);
                var::dec_ref_ext(&mut st, self.loop_cond);
            }
        } else if !self.wav_out.is_empty() {
            // Wavefront iteration was abandoned mid-flight.
            let mut st = state::lock();
            for &index in &self.wav_out {
                var::dec_ref_ext(&mut st, index);
            }
            var::dec_ref_ext(&mut st, self.wav_cond);
            drop(st);
            let _ = state::with_ts(self.backend, |ts| {
                ts.mask_stack.pop();
                Ok(())
            });
        }
        if self.state != 0 && self.state != 3 {
            warn!(
                name = %self.name,
                "Loop(): de-allocated in an inconsistent state \
                 (cond() must run exactly twice)"
            );
        }
    }
}
