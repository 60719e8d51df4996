// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host platform fixture for SPM end-to-end tests
//! INTENT: One manifest-defined platform (crypto, app, UART driver, NS agent) booted on the
//!         simulated memory bus and recording processor
//! DEPS: spm (feature `manifest`), psa-abi

use std::sync::Once;

use psa_abi::{ControlWord, RawIoVec, Sid};
use spm::arch::HostArch;
use spm::config::PlatformManifest;
use spm::ipc::Router;
use spm::mem::{MemoryBus, SystemMemory};
use spm::{PartitionId, Spm};

pub type HostSpm = Spm<SystemMemory, HostArch, Router>;

pub const CRYPTO: PartitionId = PartitionId::from_raw(256);
pub const APP: PartitionId = PartitionId::from_raw(257);
pub const DRIVER: PartitionId = PartitionId::from_raw(258);
pub const NS_AGENT: PartitionId = PartitionId::from_raw(259);

pub const HASH_SID: Sid = 0x100;
pub const KEYS_SID: Sid = 0x101;
pub const LOG_SID: Sid = 0x102;

/// Application RAM, reachable unprivileged.
pub const APP_RAM: u32 = 0x3000_0000;
/// PSA-RoT RAM, privileged only.
pub const PSA_RAM: u32 = 0x3100_0000;
/// Non-secure RAM shared with the NS agent's clients.
pub const NS_RAM: u32 = 0x2000_0000;
pub const UART: u32 = 0x5000_0000;
pub const FLASH: u32 = 0x1000_0000;

pub const MANIFEST: &str = r#"
[spm]
isolation_level = 2
stateless_slots = 4
max_sessions = 4
queue_depth = 2
named_resources = ["UART0"]

[[region]]
base = 0x1000_0000
len = 0x1000
unpriv = true

[[region]]
base = 0x2000_0000
len = 0x1000
write = true
unpriv = true
non_secure = true

[[region]]
base = 0x3000_0000
len = 0x4000
write = true
unpriv = true

[[region]]
base = 0x3100_0000
len = 0x2000
write = true

[[region]]
base = 0x5000_0000
len = 0x100
write = true
unpriv = true
resource = "UART0"

[[partition]]
id = 256
name = "crypto"
rot = "psa-rot"
priority = "high"
stack_base = 0x3100_1c00
stack_len = 0x400
entry = 0x1000_0100

[[partition]]
id = 257
name = "app"
rot = "app-rot"
stack_base = 0x3000_3c00
stack_len = 0x400
entry = 0x1000_0200
dependencies = [0x100, 0x101, 0x102]

[[partition]]
id = 258
name = "uart-driver"
rot = "app-rot"
priority = "low"
stack_base = 0x3000_3800
stack_len = 0x400
entry = 0x1000_0300
mmio = ["UART0"]

[[partition]]
id = 259
name = "ns-agent"
rot = "app-rot"
ns_agent = true
priority = "lowest"
stack_base = 0x3000_3400
stack_len = 0x400
entry = 0x1000_0400

[[service]]
sid = 0x100
name = "crypto.hash"
partition = 256
stateless = true
policy = "strict"

[[service]]
sid = 0x101
name = "crypto.keys"
partition = 256
version = 2
non_secure_clients = true

[[service]]
sid = 0x102
name = "uart.log"
partition = 258
stateless = true
"#;

/// Routes SPM logs at warn and above into a leaked in-memory sink, once per test binary.
pub fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let sink: &'static mut String = Box::leak(Box::default());
        let _ = spm::diag::install(sink, log::LevelFilter::Warn);
    });
}

/// Boots the fixture platform without starting any partition thread.
pub fn boot() -> HostSpm {
    init_logging();
    let manifest = PlatformManifest::from_toml(MANIFEST).expect("fixture manifest parses");
    Spm::from_manifest(&manifest, HostArch::new()).expect("fixture platform assembles")
}

/// Boots the fixture platform and starts every partition thread.
pub fn boot_running() -> HostSpm {
    let mut spm = boot();
    for id in [CRYPTO, APP, DRIVER, NS_AGENT] {
        spm.start_partition(id).expect("start partition");
    }
    spm
}

/// Writes an iovec descriptor array at `at`.
pub fn write_vecs(spm: &mut HostSpm, at: u32, vecs: &[(u32, u32)]) {
    for (i, (base, len)) in vecs.iter().enumerate() {
        let entry = RawIoVec::new(*base, *len);
        spm.mem_mut().write(at + (i * RawIoVec::SIZE) as u32, &entry.to_le_bytes()).expect("descriptor write");
    }
}

/// Packed control word for a default-type call with secure descriptors and buffers.
pub fn ctrl(inputs: usize, outputs: usize) -> u32 {
    ControlWord::builder().inputs(inputs).outputs(outputs).build().expect("control word").pack()
}

/// Packed control word for a call whose descriptors and buffers live in non-secure memory.
pub fn ns_ctrl(inputs: usize, outputs: usize) -> u32 {
    ControlWord::builder()
        .inputs(inputs)
        .outputs(outputs)
        .ns_vec_desc(true)
        .ns_iovec(true)
        .build()
        .expect("control word")
        .pack()
}

pub fn read_bytes(spm: &HostSpm, addr: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    spm.mem().read(addr, &mut buf).expect("read back");
    buf
}
