// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Connection-based services and handle policy
//! INTENT: connect/call/close lifecycle, version policy, pool limits and stale handles
//! DEPS: spm-e2e fixture
//! TESTS: lifecycle with rhandle, refused connect, session exhaustion, busy stateless handle,
//!        forged stateless handles, queue backpressure

use psa_abi::{
    stateless_handle, PSA_ERROR_CONNECTION_BUSY, PSA_ERROR_CONNECTION_REFUSED, PSA_NULL_HANDLE, PSA_SUCCESS,
    PSA_VERSION_NONE,
};
use spm::arch::HostArch;
use spm::config::PlatformManifest;
use spm::conn::ConnError;
use spm::ipc::{IpcError, MessageKind};
use spm::{Caller, Spm, SpmError};
use spm_e2e::*;

/// Opens a KEYS session for `caller`, with the service accepting it.
fn open(spm: &mut HostSpm, caller: Caller) -> i32 {
    let _pending = spm.connect(caller, KEYS_SID, 2).unwrap();
    let msg = spm.get(CRYPTO, KEYS_SID).unwrap().unwrap();
    assert_eq!(msg.kind, MessageKind::Connect);
    spm.reply(CRYPTO, msg.handle, PSA_SUCCESS).unwrap().handle.expect("accepted session")
}

#[test]
fn version_queries_follow_policy() {
    let spm = boot();
    assert_eq!(spm.version(Caller::Secure(APP), HASH_SID), 1);
    assert_eq!(spm.version(Caller::Secure(APP), KEYS_SID), 2);
    assert_eq!(spm.version(Caller::NonSecure(-1), KEYS_SID), 2);
    assert_eq!(spm.version(Caller::NonSecure(-1), HASH_SID), PSA_VERSION_NONE);
    // The driver never declared a dependency on crypto.
    assert_eq!(spm.version(Caller::Secure(DRIVER), KEYS_SID), PSA_VERSION_NONE);
    assert_eq!(spm.version(Caller::Secure(APP), 0xdead), PSA_VERSION_NONE);
}

#[test]
fn session_lifecycle_keeps_rhandle() {
    let mut spm = boot();
    let _pending = spm.connect(Caller::Secure(APP), KEYS_SID, 1).unwrap();
    let msg = spm.get(CRYPTO, KEYS_SID).unwrap().unwrap();
    spm.set_rhandle(CRYPTO, msg.handle, 42).unwrap();
    let handle = spm.reply(CRYPTO, msg.handle, PSA_SUCCESS).unwrap().handle.unwrap();
    assert_eq!(spm.connections().live_sessions(), 1);

    for round in 0..3 {
        let pending = spm.call(Caller::Secure(APP), handle, ctrl(0, 0), 0, 0).unwrap();
        let msg = spm.get(CRYPTO, KEYS_SID).unwrap().unwrap();
        assert_eq!(msg.rhandle, Some(42));
        assert_eq!(msg.handle, pending.conn);
        let done = spm.reply(CRYPTO, msg.handle, round).unwrap();
        assert_eq!(done.status, round);
        assert_eq!(done.handle, None);
    }

    let _pending = spm.close(Caller::Secure(APP), handle).unwrap().expect("session close");
    let msg = spm.get(CRYPTO, KEYS_SID).unwrap().unwrap();
    assert_eq!(msg.kind, MessageKind::Disconnect);
    assert_eq!(msg.rhandle, Some(42));
    assert_eq!(spm.reply(CRYPTO, msg.handle, PSA_SUCCESS).unwrap().status, PSA_SUCCESS);
    assert_eq!(spm.connections().live_sessions(), 0);

    // The handle is stale now, even once its slot is reused.
    let fresh = open(&mut spm, Caller::Secure(APP));
    assert_ne!(fresh, handle);
    assert_eq!(
        spm.call(Caller::Secure(APP), handle, ctrl(0, 0), 0, 0).unwrap_err(),
        SpmError::InvalidHandle(handle)
    );
    assert_eq!(spm.close(Caller::Secure(APP), PSA_NULL_HANDLE), Ok(None));
}

#[test]
fn refused_and_mismatched_connects() {
    let mut spm = boot();
    let err = spm.connect(Caller::Secure(APP), KEYS_SID, 3).unwrap_err();
    assert_eq!(err, SpmError::Version { sid: KEYS_SID, requested: 3 });
    assert_eq!(err.status(), PSA_ERROR_CONNECTION_REFUSED);
    assert_eq!(spm.connect(Caller::Secure(APP), HASH_SID, 1).unwrap_err(), SpmError::Stateless(HASH_SID));

    let _pending = spm.connect(Caller::Secure(APP), KEYS_SID, 2).unwrap();
    let msg = spm.get(CRYPTO, KEYS_SID).unwrap().unwrap();
    // Only success or refusal can answer a connect.
    assert_eq!(spm.reply(CRYPTO, msg.handle, 7), Err(SpmError::InvalidReply(7)));
    let done = spm.reply(CRYPTO, msg.handle, PSA_ERROR_CONNECTION_REFUSED).unwrap();
    assert_eq!(done.status, PSA_ERROR_CONNECTION_REFUSED);
    assert_eq!(done.handle, None);
    assert_eq!(spm.connections().live_sessions(), 0);
}

#[test]
fn sessions_are_bounded() {
    let mut spm = boot();
    let handles: Vec<i32> = (1..=4).map(|n| open(&mut spm, Caller::NonSecure(-n))).collect();
    assert_eq!(handles.len(), 4);
    let err = spm.connect(Caller::NonSecure(-9), KEYS_SID, 2).unwrap_err();
    assert_eq!(err, SpmError::Conn(ConnError::Exhausted));
    assert_eq!(err.status(), PSA_ERROR_CONNECTION_BUSY);

    // Handles are bound to the client that opened them.
    assert_eq!(
        spm.close(Caller::NonSecure(-2), handles[0]).unwrap_err(),
        SpmError::InvalidHandle(handles[0])
    );
    let _pending = spm.close(Caller::NonSecure(-1), handles[0]).unwrap().unwrap();
    let msg = spm.get(CRYPTO, KEYS_SID).unwrap().unwrap();
    let _done = spm.reply(CRYPTO, msg.handle, PSA_SUCCESS).unwrap();
    assert!(spm.connect(Caller::NonSecure(-9), KEYS_SID, 2).is_ok());
}

#[test]
fn stateless_handle_is_exclusive_per_call() {
    let mut spm = boot();
    let handle = spm.stateless_handle(HASH_SID).unwrap();
    let _first = spm.call(Caller::Secure(APP), handle, ctrl(0, 0), 0, 0).unwrap();
    let err = spm.call(Caller::Secure(APP), handle, ctrl(0, 0), 0, 0).unwrap_err();
    assert_eq!(err, SpmError::Conn(ConnError::Busy));
    assert_eq!(err.status(), PSA_ERROR_CONNECTION_BUSY);

    let msg = spm.get(CRYPTO, HASH_SID).unwrap().unwrap();
    let _done = spm.reply(CRYPTO, msg.handle, PSA_SUCCESS).unwrap();
    assert!(spm.call(Caller::Secure(APP), handle, ctrl(0, 0), 0, 0).is_ok());
}

#[test]
fn stateless_pool_exhaustion_is_retryable() {
    let mut manifest = PlatformManifest::from_toml(MANIFEST).unwrap();
    manifest.spm.stateless_slots = 1;
    let mut spm: HostSpm = Spm::from_manifest(&manifest, HostArch::new()).unwrap();
    let hash = spm.stateless_handle(HASH_SID).unwrap();
    let log = spm.stateless_handle(LOG_SID).unwrap();

    let _pending = spm.call(Caller::Secure(APP), hash, ctrl(0, 0), 0, 0).unwrap();
    let err = spm.call(Caller::Secure(APP), log, ctrl(0, 0), 0, 0).unwrap_err();
    assert_eq!(err, SpmError::Conn(ConnError::Exhausted));
    assert_eq!(err.status(), PSA_ERROR_CONNECTION_BUSY);

    let msg = spm.get(CRYPTO, HASH_SID).unwrap().unwrap();
    let _done = spm.reply(CRYPTO, msg.handle, PSA_SUCCESS).unwrap();
    assert!(spm.call(Caller::Secure(APP), log, ctrl(0, 0), 0, 0).is_ok());
}

#[test]
fn forged_stateless_handles() {
    let mut spm = boot();
    let hash = spm.stateless_handle(HASH_SID).unwrap();
    // Same index, version the strict service does not serve.
    let wrong_version = stateless_handle(0, 2);
    assert_ne!(wrong_version, hash);
    assert_eq!(
        spm.call(Caller::Secure(APP), wrong_version, ctrl(0, 0), 0, 0).unwrap_err(),
        SpmError::Version { sid: HASH_SID, requested: 2 }
    );
    let unknown = stateless_handle(9, 1);
    assert_eq!(
        spm.call(Caller::Secure(APP), unknown, ctrl(0, 0), 0, 0).unwrap_err(),
        SpmError::InvalidHandle(unknown)
    );
    assert_eq!(
        spm.call(Caller::Secure(APP), hash | 0x0010_0000, ctrl(0, 0), 0, 0).unwrap_err(),
        SpmError::InvalidHandle(hash | 0x0010_0000)
    );
    assert_eq!(spm.connections().live_stateless(), 0);
}

#[test]
fn full_service_queue_backs_off() {
    let mut spm = boot();
    // queue_depth = 2
    let _a = spm.connect(Caller::NonSecure(-1), KEYS_SID, 2).unwrap();
    let _b = spm.connect(Caller::NonSecure(-2), KEYS_SID, 2).unwrap();
    let err = spm.connect(Caller::NonSecure(-3), KEYS_SID, 2).unwrap_err();
    assert_eq!(err, SpmError::Ipc(IpcError::QueueFull(KEYS_SID)));
    assert_eq!(err.status(), PSA_ERROR_CONNECTION_BUSY);
    assert_eq!(spm.connections().live_sessions(), 2);
}
