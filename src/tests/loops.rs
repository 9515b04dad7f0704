use crate::types::{Backend, VarType};
use crate::var::Var;
use crate::{JitFlag, Loop};

const B: Backend = Backend::Cpu;

fn with_modes(f: impl Fn()) {
    for mode in 0..3 {
        crate::set_flag(JitFlag::LoopRecord, mode != 0);
        crate::set_flag(JitFlag::LoopOptimize, mode == 2);
        f();
    }
    crate::set_flag(JitFlag::LoopRecord, true);
    crate::set_flag(JitFlag::LoopOptimize, true);
}

#[test]
fn counted_loop() {
    let _g = super::setup();
    with_modes(|| {
        for schedule_first in [true, false] {
            let mut x = Var::counter(B, 10).unwrap();
            let mut y = Var::literal_f32(B, 0.0, 1).unwrap();
            let mut z = Var::literal_f32(B, 1.0, 1).unwrap();
            let five = Var::literal_u32(B, 5, 1).unwrap();
            let one = Var::literal_u32(B, 1, 1).unwrap();
            let one_f = Var::literal_f32(B, 1.0, 1).unwrap();

            let mut l = Loop::new("counted", &mut [&mut x, &mut y, &mut z]).unwrap();
            loop {
                let m = x.lt(&five).unwrap();
                if !l.cond(&m, &mut [&mut x, &mut y, &mut z]).unwrap() {
                    break;
                }
                y = y.add(&x.cast(VarType::F32).unwrap()).unwrap();
                x = x.add(&one).unwrap();
                z = z.add(&one_f).unwrap();
            }

            if schedule_first {
                x.schedule().unwrap();
                y.schedule().unwrap();
                z.schedule().unwrap();
                crate::eval(B).unwrap();
            }

            assert_eq!(x.to_vec_u32().unwrap(), vec![5, 5, 5, 5, 5, 5, 6, 7, 8, 9]);
            assert_eq!(
                y.to_vec_f32().unwrap(),
                vec![10.0, 10.0, 9.0, 7.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0]
            );
            assert_eq!(
                z.to_vec_f32().unwrap(),
                vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 1.0, 1.0, 1.0, 1.0]
            );
        }
    });
}

#[test]
fn side_effect_applies_once() {
    let _g = super::setup();
    with_modes(|| {
        let mut x = Var::counter(B, 10).unwrap();
        let mut y = Var::literal_f32(B, 0.0, 1).unwrap();
        let target = Var::from_u32_slice(B, &[0; 11]).unwrap();
        let five = Var::literal_u32(B, 5, 1).unwrap();
        let one = Var::literal_u32(B, 1, 1).unwrap();

        let mut l = Loop::new("scatter", &mut [&mut x, &mut y]).unwrap();
        loop {
            let m = x.lt(&five).unwrap();
            if !l.cond(&m, &mut [&mut x, &mut y]).unwrap() {
                break;
            }
            Var::scatter_add(&target, &one, &x, None).unwrap();
            y = y.add(&x.cast(VarType::F32).unwrap()).unwrap();
            x = x.add(&one).unwrap();
        }

        assert_eq!(x.to_vec_u32().unwrap(), vec![5, 5, 5, 5, 5, 5, 6, 7, 8, 9]);
        assert_eq!(
            y.to_vec_f32().unwrap(),
            vec![10.0, 10.0, 9.0, 7.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(
            target.to_vec_u32().unwrap(),
            vec![1, 2, 3, 4, 5, 0, 0, 0, 0, 0, 0]
        );
    });
}

#[test]
fn side_effect_with_constant_index() {
    let _g = super::setup();
    with_modes(|| {
        let mut x = Var::counter(B, 10).unwrap();
        let mut y = Var::literal_f32(B, 0.0, 1).unwrap();
        let target = Var::from_u32_slice(B, &[0; 11]).unwrap();
        let five = Var::literal_u32(B, 5, 1).unwrap();
        let one = Var::literal_u32(B, 1, 1).unwrap();
        let two = Var::literal_u32(B, 2, 1).unwrap();

        let mut l = Loop::new("constant-index", &mut [&mut x, &mut y]).unwrap();
        loop {
            let m = x.lt(&five).unwrap();
            if !l.cond(&m, &mut [&mut x, &mut y]).unwrap() {
                break;
            }
            Var::scatter_add(&target, &two, &two, None).unwrap();
            y = y.add(&x.cast(VarType::F32).unwrap()).unwrap();
            x = x.add(&one).unwrap();
        }

        assert_eq!(
            target.to_vec_u32().unwrap(),
            vec![0, 0, 30, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    });
}

#[test]
fn side_effect_masking_stays_in_bounds() {
    let _g = super::setup();
    with_modes(|| {
        let mut x = Var::counter(B, 1_000_000).unwrap();
        let target = Var::from_u32_slice(B, &[0; 10]).unwrap();
        let ten = Var::literal_u32(B, 10, 1).unwrap();
        let one = Var::literal_u32(B, 1, 1).unwrap();

        let mut l = Loop::new("masked", &mut [&mut x]).unwrap();
        loop {
            let m = x.lt(&ten).unwrap();
            if !l.cond(&m, &mut [&mut x]).unwrap() {
                break;
            }
            // Would fault without correct masking of inactive lanes.
            Var::scatter_add(&target, &one, &x, None).unwrap();
            x = x.add(&one).unwrap();
        }

        assert_eq!(
            target.to_vec_u32().unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
        );
    });
}

#[test]
fn recording_emits_one_kernel_regardless_of_trip_count() {
    let _g = super::setup();
    crate::set_flag(JitFlag::LoopRecord, true);
    let before = crate::cache_counters().launches;

    let mut x = Var::from_u32_slice(B, &(0..64).collect::<Vec<u32>>()).unwrap();
    let limit = Var::literal_u32(B, 60, 1).unwrap();
    let one = Var::literal_u32(B, 1, 1).unwrap();
    let mut l = Loop::new("single-kernel", &mut [&mut x]).unwrap();
    loop {
        let m = x.lt(&limit).unwrap();
        if !l.cond(&m, &mut [&mut x]).unwrap() {
            break;
        }
        x = x.add(&one).unwrap();
    }
    let out = x.to_vec_u32().unwrap();
    assert_eq!(out[0], 60);
    assert_eq!(out[63], 63);
    assert_eq!(crate::cache_counters().launches - before, 1);
}

#[test]
fn recording_and_wavefront_agree_bitwise() {
    let _g = super::setup();
    let run = |record: bool| -> Vec<u32> {
        crate::set_flag(JitFlag::LoopRecord, record);
        let mut x = Var::from_u32_slice(B, &[3, 1, 4, 1, 5, 9, 2, 6]).unwrap();
        let mut acc = Var::literal_u32(B, 0, 1).unwrap();
        let limit = Var::literal_u32(B, 10, 1).unwrap();
        let one = Var::literal_u32(B, 1, 1).unwrap();
        let mut l = Loop::new("agree", &mut [&mut x, &mut acc]).unwrap();
        loop {
            let m = x.lt(&limit).unwrap();
            if !l.cond(&m, &mut [&mut x, &mut acc]).unwrap() {
                break;
            }
            acc = acc.add(&x).unwrap();
            x = x.add(&one).unwrap();
        }
        let mut out = x.to_vec_u32().unwrap();
        out.extend(acc.to_vec_u32().unwrap());
        out
    };
    let recorded = run(true);
    let wavefront = run(false);
    assert_eq!(recorded, wavefront);
    crate::set_flag(JitFlag::LoopRecord, true);
}

#[test]
fn inconsistent_sizes_are_rejected() {
    let _g = super::setup();
    crate::set_flag(JitFlag::LoopRecord, true);
    let mut a = Var::counter(B, 10).unwrap();
    let mut b = Var::counter(B, 7).unwrap();
    assert!(Loop::new("bad", &mut [&mut a, &mut b]).is_err());
}

#[test]
fn abandoned_recording_rolls_back_side_effects() {
    let _g = super::setup();
    crate::set_flag(JitFlag::LoopRecord, true);
    let postpone_before = crate::flag(JitFlag::PostponeSideEffects);

    let target = Var::from_u32_slice(B, &[0; 4]).unwrap();
    {
        let mut x = Var::counter(B, 4).unwrap();
        let two = Var::literal_u32(B, 2, 1).unwrap();
        let one = Var::literal_u32(B, 1, 1).unwrap();
        let mut l = Loop::new("abandoned", &mut [&mut x]).unwrap();
        let m = x.lt(&two).unwrap();
        assert!(l.cond(&m, &mut [&mut x]).unwrap());
        Var::scatter_add(&target, &one, &x, None).unwrap();
        // The loop is dropped before its second cond() call.
    }

    assert_eq!(crate::flag(JitFlag::PostponeSideEffects), postpone_before);
    {
        let st = crate::state::lock();
        assert_eq!(crate::var::var(&st, target.index()).ref_count_se, 0);
    }
    // The rolled-back scatter must not fire on later evaluations.
    assert_eq!(target.to_vec_u32().unwrap(), vec![0, 0, 0, 0]);
}
