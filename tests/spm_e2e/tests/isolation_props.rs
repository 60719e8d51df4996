// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for caller-supplied output vectors
//! INTENT: An app-rot caller gets a buffer accepted iff it lies wholly in its own writable RAM
//! DEPS: spm-e2e fixture, proptest

use proptest::prelude::*;
use spm::iovec::{MarshalError, VecDir};
use spm::{Caller, SpmError};
use spm_e2e::*;

const APP_RAM_END: u64 = APP_RAM as u64 + 0x4000;
const OUT_DESC: u32 = APP_RAM;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn output_accepted_iff_inside_app_ram(base in 0x2fff_f000u32..0x3100_1000, len in 1u32..0x800) {
        let mut spm = boot();
        let handle = spm.stateless_handle(HASH_SID).unwrap();
        write_vecs(&mut spm, OUT_DESC, &[(base, len)]);
        let inside = base >= APP_RAM && base as u64 + len as u64 <= APP_RAM_END;
        match spm.call(Caller::Secure(APP), handle, ctrl(0, 1), 0, OUT_DESC) {
            Ok(_pending) => prop_assert!(inside),
            Err(err) => {
                prop_assert!(!inside);
                prop_assert_eq!(err, SpmError::Marshal(MarshalError::BufferDenied(VecDir::Out, 0)));
                prop_assert_eq!(spm.connections().live_stateless(), 0);
            }
        }
    }

    #[test]
    fn rejected_calls_never_leak_connections(in_len in 0usize..4, out_len in 0usize..4, bad in any::<bool>()) {
        let mut spm = boot();
        let handle = spm.stateless_handle(HASH_SID).unwrap();
        let target = if bad { PSA_RAM } else { APP_RAM + 0x400 };
        let vecs: Vec<(u32, u32)> = (0..4).map(|i| (target + i * 0x40, 0x20)).collect();
        write_vecs(&mut spm, APP_RAM, &vecs[..in_len]);
        write_vecs(&mut spm, APP_RAM + 0x40, &vecs[in_len..(in_len + out_len).min(4)]);
        let raw = ((in_len as u32) << 8) | out_len as u32;
        let result = spm.call(Caller::Secure(APP), handle, raw, APP_RAM, APP_RAM + 0x40);
        let valid = in_len + out_len <= 4 && (!bad || in_len + out_len == 0);
        prop_assert_eq!(result.is_ok(), valid);
        prop_assert_eq!(spm.connections().live_stateless(), usize::from(valid));
    }
}
