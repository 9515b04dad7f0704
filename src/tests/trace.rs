use crate::types::{Backend, VarType};
use crate::var::{self, Var};

const B: Backend = Backend::Cpu;

#[test]
fn arithmetic_chain() {
    let _g = super::setup();
    let x = Var::counter(B, 8).unwrap();
    let two = Var::literal_u32(B, 2, 1).unwrap();
    let three = Var::literal_u32(B, 3, 1).unwrap();
    let y = x.mul(&two).unwrap().add(&three).unwrap();
    assert_eq!(
        y.to_vec_u32().unwrap(),
        vec![3, 5, 7, 9, 11, 13, 15, 17]
    );
}

#[test]
fn float_ops_select_and_cast() {
    let _g = super::setup();
    let x = Var::counter(B, 6).unwrap().cast(VarType::F32).unwrap();
    let half = Var::literal_f32(B, 0.5, 1).unwrap();
    let three = Var::literal_f32(B, 3.0, 1).unwrap();
    let mask = x.lt(&three).unwrap();
    let y = Var::select(&mask, &x.add(&half).unwrap(), &x.mul(&half).unwrap()).unwrap();
    assert_eq!(y.to_vec_f32().unwrap(), vec![0.5, 1.5, 2.5, 1.5, 2.0, 2.5]);
}

#[test]
fn comparison_and_bool_ops() {
    let _g = super::setup();
    let x = Var::counter(B, 5).unwrap();
    let two = Var::literal_u32(B, 2, 1).unwrap();
    let four = Var::literal_u32(B, 4, 1).unwrap();
    let m = x.ge(&two).unwrap().and(&x.lt(&four).unwrap()).unwrap();
    assert_eq!(
        m.to_vec_bool().unwrap(),
        vec![false, false, true, true, false]
    );
    let inverted = m.not().unwrap();
    assert_eq!(
        inverted.to_vec_bool().unwrap(),
        vec![true, true, false, false, true]
    );
}

#[test]
fn literal_folding_produces_literals() {
    let _g = super::setup();
    let a = Var::literal_u32(B, 6, 4).unwrap();
    let b = Var::literal_u32(B, 7, 4).unwrap();
    let c = a.mul(&b).unwrap();
    {
        let st = crate::state::lock();
        let v = var::var(&st, c.index());
        assert_eq!(v.stmt, var::Stmt::Literal(42));
    }
    assert_eq!(c.to_vec_u32().unwrap(), vec![42; 4]);
}

#[test]
fn common_subexpressions_are_shared() {
    let _g = super::setup();
    let x = Var::counter(B, 16).unwrap();
    let y = Var::counter(B, 16).unwrap();
    assert_eq!(x.index(), y.index());
    let a = x.add(&y).unwrap();
    let b = x.add(&y).unwrap();
    assert_eq!(a.index(), b.index());
}

#[test]
fn broadcasting_and_size_mismatch() {
    let _g = super::setup();
    let x = Var::counter(B, 4).unwrap();
    let s = Var::literal_u32(B, 10, 1).unwrap();
    assert_eq!(x.add(&s).unwrap().to_vec_u32().unwrap(), vec![10, 11, 12, 13]);

    let other = Var::counter(B, 5).unwrap();
    assert!(x.add(&other).is_err());
}

#[test]
fn type_mismatch_is_rejected() {
    let _g = super::setup();
    let x = Var::counter(B, 4).unwrap();
    let f = Var::literal_f32(B, 1.0, 1).unwrap();
    assert!(x.add(&f).is_err());
}

#[test]
fn one_kernel_per_size_group() {
    let _g = super::setup();
    let before = crate::cache_counters().launches;
    let one = Var::literal_u32(B, 1, 1).unwrap();
    let a = Var::counter(B, 100).unwrap().add(&one).unwrap();
    let b = Var::counter(B, 200).unwrap().add(&one).unwrap();
    a.schedule().unwrap();
    b.schedule().unwrap();
    crate::eval(B).unwrap();
    assert_eq!(crate::cache_counters().launches - before, 2);
    assert_eq!(a.to_vec_u32().unwrap()[99], 100);
    assert_eq!(b.to_vec_u32().unwrap()[199], 200);
}

#[test]
fn scatter_marks_target_dirty() {
    let _g = super::setup();
    let target = Var::from_u32_slice(B, &[0; 8]).unwrap();
    let index = Var::counter(B, 4).unwrap();
    let one = Var::literal_u32(B, 1, 1).unwrap();
    Var::scatter_add(&target, &one, &index, None).unwrap();
    {
        let st = crate::state::lock();
        assert!(var::var(&st, target.index()).ref_count_se > 0);
    }
    // Reading the dirty target forces the pending side effect.
    assert_eq!(
        target.to_vec_u32().unwrap(),
        vec![1, 1, 1, 1, 0, 0, 0, 0]
    );
    let st = crate::state::lock();
    assert_eq!(var::var(&st, target.index()).ref_count_se, 0);
}

#[test]
fn scatter_respects_explicit_mask() {
    let _g = super::setup();
    let target = Var::from_u32_slice(B, &[0; 6]).unwrap();
    let index = Var::counter(B, 6).unwrap();
    let three = Var::literal_u32(B, 3, 1).unwrap();
    let mask = index.lt(&three).unwrap();
    let one = Var::literal_u32(B, 1, 1).unwrap();
    Var::scatter_add(&target, &one, &index, Some(&mask)).unwrap();
    assert_eq!(target.to_vec_u32().unwrap(), vec![1, 1, 1, 0, 0, 0]);
}

#[test]
fn kernel_history_records_launches() {
    let _g = super::setup();
    let _ = crate::kernel_history();
    crate::set_flag(crate::JitFlag::KernelHistory, true);
    let one = Var::literal_u32(B, 1, 1).unwrap();
    let x = Var::counter(B, 32).unwrap().add(&one).unwrap();
    let _ = x.to_vec_u32().unwrap();
    crate::set_flag(crate::JitFlag::KernelHistory, false);
    let history = crate::kernel_history();
    assert!(!history.is_empty());
    assert!(history
        .iter()
        .any(|e| e.kernel_type == crate::KernelType::Jit && e.size == 32));
    for entry in &history {
        if let crate::kernel::HistoryTiming::Task(task) = &entry.timing {
            assert!(task.is_done());
        }
    }
}

#[test]
fn eval_with_nothing_pending_is_a_no_op() {
    let _g = super::setup();
    crate::eval(B).unwrap();
}

#[test]
fn variables_are_freed_when_handles_drop() {
    let _g = super::setup();
    let index;
    {
        let x = Var::counter(B, 977).unwrap();
        let one = Var::literal_u32(B, 1, 1).unwrap();
        let y = x.add(&one).unwrap();
        index = y.index();
    }
    let st = crate::state::lock();
    assert!(!st.vars.contains_key(&index));
}
