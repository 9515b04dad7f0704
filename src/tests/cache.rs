use crate::types::Backend;
use crate::var::Var;

const B: Backend = Backend::Cpu;

fn run_trace(n: u32) -> Vec<u32> {
    let x = Var::counter(B, n).unwrap();
    let seven = Var::literal_u32(B, 7, 1).unwrap();
    x.mul(&seven).unwrap().to_vec_u32().unwrap()
}

#[test]
fn identical_traces_hit_the_cache() {
    let _g = super::setup();
    let first = run_trace(313);
    let before = crate::cache_counters();
    let second = run_trace(313);
    let after = crate::cache_counters();
    assert_eq!(first, second);
    assert_eq!(after.hits, before.hits + 1);
    assert_eq!(after.hard_misses, before.hard_misses);
    assert_eq!(after.launches, before.launches + 1);
}

#[test]
fn disk_cache_serves_soft_misses() {
    let _g = super::setup();
    let first = run_trace(617);

    // Forget the in-memory entry; the disk copy must satisfy the reload.
    {
        let mut st = crate::state::lock();
        st.kernels.clear();
    }
    let before = crate::cache_counters();
    let second = run_trace(617);
    let after = crate::cache_counters();
    assert_eq!(first, second);
    assert_eq!(after.soft_misses, before.soft_misses + 1);
    assert_eq!(after.hard_misses, before.hard_misses);
}

#[test]
fn cache_file_round_trip() {
    let _g = super::setup();
    let dir = tempfile::tempdir().unwrap();
    let payload = vec![1u8, 2, 3, 4, 5];
    crate::kernel::kernel_write(dir.path(), "source text", B, 0xabcdef, &payload, 128).unwrap();
    let (loaded, block_size) = crate::kernel::kernel_load(dir.path(), B, 0xabcdef).unwrap();
    assert_eq!(loaded, payload);
    assert_eq!(block_size, 128);

    // Unknown hashes and wrong backends miss.
    assert!(crate::kernel::kernel_load(dir.path(), B, 0x123456).is_none());
    assert!(crate::kernel::kernel_load(dir.path(), Backend::Cuda, 0xabcdef).is_none());
}

#[test]
fn corrupt_cache_entries_are_ignored() {
    let _g = super::setup();
    let dir = tempfile::tempdir().unwrap();
    crate::kernel::kernel_write(dir.path(), "src", B, 0x42, &[9, 9, 9], 64).unwrap();
    let path = dir.path().join(format!("cpu-{:032x}.kernel", 0x42));
    let mut bytes = std::fs::read(&path).unwrap();
    let at = bytes.len() / 2;
    bytes[at] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();
    assert!(crate::kernel::kernel_load(dir.path(), B, 0x42).is_none());
}

#[test]
fn kernel_text_hash_is_stable() {
    let _g = super::setup();
    let a = crate::codegen::hash_kernel("define void @k() { ret void }");
    let b = crate::codegen::hash_kernel("define void @k() { ret void }");
    let c = crate::codegen::hash_kernel("define void @k() { ret void } ");
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn name_rewrite_preserves_offsets() {
    let _g = super::setup();
    let mut text = format!(
        "define void @{}{}(i32 %start) {{}}",
        crate::codegen::KERNEL_PREFIX,
        "^".repeat(32)
    );
    let len = text.len();
    crate::codegen::rewrite_kernel_name(&mut text, 0x0123456789abcdef0123456789abcdef);
    assert_eq!(text.len(), len);
    assert!(text.contains("smelt_0123456789abcdef0123456789abcdef"));
    assert!(!text.contains('^'));
}
