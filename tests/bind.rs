use std::fs::File;
use std::sync::Arc;

use libpassthrough_fs::passthrough::{
    BackingDescriptor, BackingHandle, BackingSb, BindSource, Opcode, PassthroughConfig,
    PassthroughCtx, PassthroughError, VirtualFile, VirtualInode,
};
use libpassthrough_fs::util::open_options::OpenOptions;

fn scratch_file(name: &str, write: bool) -> File {
    let dir = "/tmp/libpassthrough-fs/bind";
    std::fs::create_dir_all(dir).unwrap();
    let path = format!("{dir}/{name}");
    if !write {
        std::fs::write(&path, b"ro").unwrap();
        return File::open(path).unwrap();
    }
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap()
}

fn virtual_file(backing: &File) -> VirtualFile {
    let attr = BackingHandle::stat(backing).unwrap();
    VirtualFile::open(VirtualInode::new(attr.ino, attr))
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn bind_succeeds_and_release_is_idempotent() {
    init_logger();
    let file = scratch_file("bind_ok", true);
    let mut vf = virtual_file(&file);
    let ctx = PassthroughCtx::default();

    ctx.bind(
        &mut vf,
        Opcode::Open,
        BindSource::Descriptor(BackingDescriptor::from_file(file)),
    )
    .unwrap();
    assert!(vf.is_passthrough());
    assert_eq!(vf.backing().unwrap().stack_depth(), 1);

    vf.release();
    assert!(!vf.is_passthrough());
    vf.release();
    assert!(!vf.is_passthrough());
}

#[test]
fn bind_rejects_non_open_opcodes() {
    init_logger();
    let file = scratch_file("bind_opcode", true);
    let mut vf = virtual_file(&file);
    let ctx = PassthroughCtx::default();

    for opcode in [Opcode::Lookup, Opcode::Read, Opcode::Write, Opcode::Release] {
        let err = ctx
            .bind(
                &mut vf,
                opcode,
                BindSource::Descriptor(BackingDescriptor::from_file(
                    scratch_file("bind_opcode", true),
                )),
            )
            .unwrap_err();
        assert!(matches!(err, PassthroughError::InvalidOperation), "{opcode:?}");
        assert!(!vf.is_passthrough());
    }
    drop(file);
}

#[test]
fn readonly_backing_is_rejected_without_leaking() {
    init_logger();
    let ro = scratch_file("bind_ro", false);
    let mut vf = virtual_file(&ro);
    let ctx = PassthroughCtx::default();

    let handle: Arc<dyn BackingHandle> = Arc::new(ro);
    let desc = BackingDescriptor::new(handle.clone(), BackingSb::new(0));
    assert_eq!(Arc::strong_count(&handle), 2);

    let err = ctx
        .bind(&mut vf, Opcode::Open, BindSource::Descriptor(desc))
        .unwrap_err();
    assert!(matches!(err, PassthroughError::UnsupportedBackingFile));
    assert!(!vf.is_passthrough());
    // The rejected candidate was released, not parked anywhere.
    assert_eq!(Arc::strong_count(&handle), 1);
}

#[test]
fn stacking_depth_is_bounded() {
    init_logger();
    let file = scratch_file("bind_depth", true);
    let mut vf = virtual_file(&file);
    let ctx = PassthroughCtx::default();
    let max = ctx.config().max_stack_depth;

    let handle: Arc<dyn BackingHandle> = Arc::new(file);
    // A backing fs already at the maximum depth pushes the bind over it.
    let desc = BackingDescriptor::new(handle.clone(), BackingSb::new(max));
    let err = ctx
        .bind(&mut vf, Opcode::Create, BindSource::Descriptor(desc))
        .unwrap_err();
    assert!(matches!(err, PassthroughError::StackingDepthExceeded));
    assert!(!vf.is_passthrough());
    assert_eq!(Arc::strong_count(&handle), 1);

    // One level below the maximum is still acceptable.
    let desc = BackingDescriptor::new(handle.clone(), BackingSb::new(max - 1));
    ctx.bind(&mut vf, Opcode::Create, BindSource::Descriptor(desc))
        .unwrap();
    assert_eq!(vf.backing().unwrap().stack_depth(), max);
}

#[test]
fn rebinding_a_bound_open_is_rejected() {
    init_logger();
    let file = scratch_file("bind_twice", true);
    let mut vf = virtual_file(&file);
    let ctx = PassthroughCtx::default();

    ctx.bind(
        &mut vf,
        Opcode::Open,
        BindSource::Descriptor(BackingDescriptor::from_file(file)),
    )
    .unwrap();

    // A second bind must fail without consuming a registered token.
    let token = ctx
        .register(BackingDescriptor::from_file(scratch_file("bind_twice_b", true)))
        .unwrap();
    let err = ctx
        .bind(&mut vf, Opcode::Open, BindSource::Token(token))
        .unwrap_err();
    assert!(matches!(err, PassthroughError::InvalidOperation));
    assert_eq!(ctx.registry().len(), 1);

    // The untouched token still resolves for a fresh open.
    let mut other = virtual_file(&scratch_file("bind_twice_b", true));
    ctx.bind(&mut other, Opcode::Open, BindSource::Token(token))
        .unwrap();
    assert!(ctx.registry().is_empty());
}

#[test]
fn register_rejects_files_missing_capabilities() {
    init_logger();
    let ctx = PassthroughCtx::default();
    let err = ctx
        .register(BackingDescriptor::from_file(scratch_file("register_ro", false)))
        .unwrap_err();
    assert!(matches!(err, PassthroughError::UnsupportedBackingFile));
    assert!(ctx.registry().is_empty());
}

#[test]
fn setup_without_passthrough_flag_is_a_noop() {
    init_logger();
    let file = scratch_file("setup_noop", true);
    let mut vf = virtual_file(&file);
    let ctx = PassthroughCtx::default();

    let bound = ctx
        .setup(&mut vf, Opcode::Open, OpenOptions::DIRECT_IO, None)
        .unwrap();
    assert!(!bound);
    assert!(!vf.is_passthrough());

    // Flag set but no source to resolve.
    let err = ctx
        .setup(&mut vf, Opcode::Open, OpenOptions::PASSTHROUGH, None)
        .unwrap_err();
    assert!(matches!(err, PassthroughError::InvalidHandle));

    let bound = ctx
        .setup(
            &mut vf,
            Opcode::Open,
            OpenOptions::PASSTHROUGH | OpenOptions::DIRECT_IO,
            Some(BindSource::Descriptor(BackingDescriptor::from_file(file))),
        )
        .unwrap();
    assert!(bound);
    assert!(vf.is_passthrough());
}

#[test]
fn unknown_token_fails_with_invalid_handle() {
    init_logger();
    let file = scratch_file("bind_badtoken", true);
    let mut vf = virtual_file(&file);
    let ctx = PassthroughCtx::default();

    let err = ctx
        .bind(&mut vf, Opcode::Open, BindSource::Token(42))
        .unwrap_err();
    assert!(matches!(err, PassthroughError::InvalidHandle));
}

/// End-to-end handshake: register, bind by token, write through the
/// forwarder, observe the propagated size, close, then verify the token is
/// stale.
#[tokio::test]
async fn register_bind_write_close_scenario() {
    use libpassthrough_fs::passthrough::IoRequest;

    init_logger();
    let file = scratch_file("scenario", true);
    let mut vf = virtual_file(&file);
    let ctx = PassthroughCtx::new(PassthroughConfig::default());

    let token = ctx.register(BackingDescriptor::from_file(file)).unwrap();
    assert!(token > 0);

    ctx.bind(&mut vf, Opcode::Open, BindSource::Token(token))
        .unwrap();

    let payload = vec![0xa5u8; 4096];
    let n = vf.write(&ctx, &payload, IoRequest::at(0)).await.unwrap();
    assert_eq!(n, 4096);
    assert_eq!(vf.inode().size(), 4096);
    assert_eq!(vf.pos(), 4096);

    vf.release();
    assert!(!vf.is_passthrough());

    // The consumed token must not resolve again.
    let mut other = virtual_file(&scratch_file("scenario_b", true));
    let err = ctx
        .bind(&mut other, Opcode::Open, BindSource::Token(token))
        .unwrap_err();
    assert!(matches!(err, PassthroughError::InvalidHandle));
}
