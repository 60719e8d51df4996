// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Partition switching around calls
//! INTENT: Priority order, boundary reprogramming and stack registers across a call chain
//! DEPS: spm-e2e fixture
//! TESTS: boot order, call/reply switches, named-region masks, saved stack pointers

use psa_abi::PSA_SUCCESS;
use spm::arch::{ArchOps, EXC_RETURN_THREAD_PSP};
use spm::Caller;
use spm_e2e::*;

#[test]
fn highest_priority_partition_runs_first() {
    let mut spm = boot_running();
    let first = spm.schedule().expect("runnable partitions");
    assert_eq!(first.from, None);
    assert_eq!(first.to, CRYPTO);
    assert!(first.boundary_switched);
    assert_eq!(first.exc_return, EXC_RETURN_THREAD_PSP);
    assert!(spm.arch().is_privileged());
    assert_eq!(spm.arch().psplim(), 0x3100_1c00);
    // Nothing outranks crypto, so it keeps the processor.
    assert_eq!(spm.schedule(), None);
}

#[test]
fn call_chain_switches_boundaries() {
    let mut spm = boot_running();
    assert_eq!(spm.schedule().unwrap().to, CRYPTO);
    spm.wait(CRYPTO);

    let app = spm.schedule().unwrap();
    assert_eq!((app.from, app.to), (Some(CRYPTO), APP));
    assert!(app.boundary_switched);
    assert!(!spm.arch().is_privileged());
    assert_eq!(spm.arch().named_regions(), 0);

    // The app logs through the UART driver and blocks until it answers.
    let log = spm.stateless_handle(LOG_SID).unwrap();
    let pending = spm.call(Caller::Secure(APP), log, ctrl(0, 0), 0, 0).unwrap();
    let driver = spm.schedule().unwrap();
    assert_eq!((driver.from, driver.to), (Some(APP), DRIVER));
    assert!(driver.boundary_switched);
    assert!(!spm.arch().is_privileged());
    assert_eq!(spm.arch().named_regions(), 0b1);

    let msg = spm.get(DRIVER, LOG_SID).unwrap().unwrap();
    let done = spm.reply(DRIVER, msg.handle, PSA_SUCCESS).unwrap();
    assert_eq!(done.conn, pending.conn);
    spm.wait(DRIVER);

    let back = spm.schedule().unwrap();
    assert_eq!((back.from, back.to), (Some(DRIVER), APP));
    assert_eq!(spm.arch().named_regions(), 0);
}

#[test]
fn secure_service_preempts_the_caller() {
    let mut spm = boot_running();
    assert_eq!(spm.schedule().unwrap().to, CRYPTO);
    spm.wait(CRYPTO);
    assert_eq!(spm.schedule().unwrap().to, APP);

    let hash = spm.stateless_handle(HASH_SID).unwrap();
    let switches = spm.arch().pending_switches();
    let _pending = spm.call(Caller::Secure(APP), hash, ctrl(0, 0), 0, 0).unwrap();
    assert_eq!(spm.arch().pending_switches(), switches + 1);

    let next = spm.schedule().unwrap();
    assert_eq!(next.to, CRYPTO);
    assert!(next.boundary_switched);
    assert!(spm.arch().is_privileged());
}

#[test]
fn saved_stack_pointer_is_restored() {
    let mut spm = boot_running();
    assert_eq!(spm.schedule().unwrap().to, CRYPTO);
    spm.wait(CRYPTO);
    assert_eq!(spm.schedule().unwrap().to, APP);
    let initial = spm.arch().psp();
    assert!(initial < 0x3000_4000 && initial >= 0x3000_3c00);

    // The app is interrupted deeper in its stack and crypto takes over.
    spm.save_context(0x3000_3e00);
    let hash = spm.stateless_handle(HASH_SID).unwrap();
    let _pending = spm.call(Caller::Secure(APP), hash, ctrl(0, 0), 0, 0).unwrap();
    assert_eq!(spm.schedule().unwrap().to, CRYPTO);
    let msg = spm.get(CRYPTO, HASH_SID).unwrap().unwrap();
    let _done = spm.reply(CRYPTO, msg.handle, PSA_SUCCESS).unwrap();
    spm.wait(CRYPTO);

    assert_eq!(spm.schedule().unwrap().to, APP);
    assert_eq!(spm.arch().psp(), 0x3000_3e00);
    assert_eq!(spm.arch().psplim(), 0x3000_3c00);
}

#[test]
fn yielding_rotates_equal_priorities() {
    let mut spm = boot();
    spm.start_partition(APP).unwrap();
    assert_eq!(spm.schedule().unwrap().to, APP);
    spm.yield_now();
    // Alone in its class, the app is picked again without a switch.
    assert_eq!(spm.schedule(), None);
    assert_eq!(spm.running(), Some(APP));
}
