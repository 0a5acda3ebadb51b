use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::OnceLock;

use ferry_migration::{
    loadvm_state, save_device_state, save_vm_state, savevm_state_begin, savevm_state_cleanup,
    savevm_state_complete, savevm_state_iterate, InstanceId, IterationStatus, LiveSaveHandler,
    MachineSync, MigrationError, OpaqueId, RegisterOptions, Registry, SaveStateHandler,
    SaveVmConfig, SectionType, VM_FILE_MAGIC, VM_FILE_VERSION,
};
use ferry_vmstate::{
    vmstate_array, vmstate_single, Channel, MemTransport, Transport, VmStateDescription,
    VmStateError, WriterTransport, UINT32, UINT8,
};
use proptest::prelude::*;

#[derive(Debug, Default, Clone, PartialEq)]
struct Uart {
    lcr: u8,
    ier: u8,
    scratch: u32,
    fifo: [u8; 4],
}

fn vmstate_uart() -> &'static VmStateDescription<Uart> {
    static VMSD: OnceLock<VmStateDescription<Uart>> = OnceLock::new();
    VMSD.get_or_init(|| {
        VmStateDescription::new("uart", 2)
            .minimum_version_id(2)
            .field(vmstate_single!(Uart, lcr, &UINT8))
            .field(vmstate_single!(Uart, ier, &UINT8))
            .field(vmstate_single!(Uart, scratch, &UINT32))
            .field(vmstate_array!(Uart, fifo, 4, &UINT8))
    })
}

#[derive(Debug, Default)]
struct Passthrough {
    bar: u32,
}

fn vmstate_passthrough() -> &'static VmStateDescription<Passthrough> {
    static VMSD: OnceLock<VmStateDescription<Passthrough>> = OnceLock::new();
    VMSD.get_or_init(|| {
        VmStateDescription::new("passthrough", 1)
            .unmigratable()
            .field(vmstate_single!(Passthrough, bar, &UINT32))
    })
}

/// Schema-less component: a single be64 counter.
struct Clock {
    ticks: Rc<Cell<u64>>,
}

impl SaveStateHandler for Clock {
    fn save_state(&mut self, ch: &mut Channel) {
        ch.put_be64(self.ticks.get());
    }

    fn load_state(&mut self, ch: &mut Channel, _version_id: u32) -> ferry_migration::Result<()> {
        self.ticks.set(ch.get_be64()?);
        Ok(())
    }
}

#[derive(Default)]
struct LiveLog {
    setups: Cell<u32>,
    iterations: Cell<u32>,
    cancels: Cell<u32>,
    cleanups: Cell<u32>,
}

/// Live entity that streams `data` in `chunk`-sized pieces. Every payload is a be16 length
/// followed by that many bytes.
struct Streamer {
    data: Vec<u8>,
    sent: usize,
    chunk: usize,
    received: Rc<RefCell<Vec<u8>>>,
    log: Rc<LiveLog>,
}

impl Streamer {
    fn send(&mut self, ch: &mut Channel, max: usize) {
        let n = max.min(self.data.len() - self.sent);
        ch.put_be16(n as u16);
        ch.put_buffer(&self.data[self.sent..self.sent + n]);
        self.sent += n;
    }
}

impl LiveSaveHandler for Streamer {
    fn setup(&mut self, ch: &mut Channel) -> ferry_migration::Result<()> {
        self.log.setups.set(self.log.setups.get() + 1);
        self.sent = 0;
        self.send(ch, self.chunk);
        Ok(())
    }

    fn iterate(&mut self, ch: &mut Channel) -> ferry_migration::Result<IterationStatus> {
        self.log.iterations.set(self.log.iterations.get() + 1);
        self.send(ch, self.chunk);
        Ok(if self.sent == self.data.len() {
            IterationStatus::Complete
        } else {
            IterationStatus::Continue
        })
    }

    fn complete(&mut self, ch: &mut Channel) -> ferry_migration::Result<()> {
        while self.sent < self.data.len() {
            self.send(ch, u16::MAX as usize);
        }
        ch.put_be16(0);
        Ok(())
    }

    fn pending(&mut self, _max_size: u64) -> u64 {
        (self.data.len() - self.sent) as u64
    }

    fn cancel(&mut self) {
        self.log.cancels.set(self.log.cancels.get() + 1);
    }

    fn cleanup(&mut self) {
        self.log.cleanups.set(self.log.cleanups.get() + 1);
    }

    fn load_state(&mut self, ch: &mut Channel, _version_id: u32) -> ferry_migration::Result<()> {
        let n = ch.get_be16()? as usize;
        let mut buf = vec![0u8; n];
        ch.get_buffer(&mut buf)?;
        self.received.borrow_mut().extend_from_slice(&buf);
        Ok(())
    }
}

struct Machine {
    uart: Rc<RefCell<Uart>>,
    ticks: Rc<Cell<u64>>,
    received: Vec<Rc<RefCell<Vec<u8>>>>,
    logs: Vec<Rc<LiveLog>>,
}

fn machine(config: SaveVmConfig, streams: &[(Vec<u8>, usize)]) -> (Registry, Machine) {
    let mut registry = Registry::new(config);
    let mut m = Machine {
        uart: Rc::new(RefCell::new(Uart::default())),
        ticks: Rc::new(Cell::new(0)),
        received: Vec::new(),
        logs: Vec::new(),
    };

    registry
        .register_vmstate(
            InstanceId::Auto,
            vmstate_uart(),
            m.uart.clone(),
            RegisterOptions::default(),
        )
        .unwrap();
    registry
        .register_savevm(
            "clock",
            InstanceId::Auto,
            1,
            Box::new(Clock {
                ticks: m.ticks.clone(),
            }),
            OpaqueId::of(&m.ticks),
            RegisterOptions::default(),
        )
        .unwrap();
    for (i, (data, chunk)) in streams.iter().enumerate() {
        let received = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::new(LiveLog::default());
        registry
            .register_savevm_live(
                "stream",
                InstanceId::Auto,
                1,
                Box::new(Streamer {
                    data: data.clone(),
                    sent: 0,
                    chunk: *chunk,
                    received: received.clone(),
                    log: log.clone(),
                }),
                OpaqueId::new(0x1000 + i),
                RegisterOptions::default(),
            )
            .unwrap();
        m.received.push(received);
        m.logs.push(log);
    }
    (registry, m)
}

fn populate(m: &Machine) {
    *m.uart.borrow_mut() = Uart {
        lcr: 0x03,
        ier: 0x0f,
        scratch: 0xdead_beef,
        fifo: [1, 2, 3, 4],
    };
    m.ticks.set(123_456_789);
}

fn save(registry: &mut Registry) -> Vec<u8> {
    let mem = MemTransport::new();
    let mut ch = Channel::new_writer(mem.clone());
    save_vm_state(registry, &mut ch).unwrap();
    ch.close().unwrap();
    mem.contents()
}

fn load(registry: &mut Registry, bytes: Vec<u8>) -> Result<(), MigrationError> {
    let mut ch = Channel::new_reader(MemTransport::from_bytes(bytes));
    loadvm_state(registry, &mut ch)?;
    assert_eq!(ch.peek_u8(0), None, "trailing bytes after EOF");
    Ok(())
}

#[test]
fn snapshot_round_trip_restores_every_entity() {
    let streams = vec![((0..200u8).collect::<Vec<_>>(), 64)];
    let (mut src, src_m) = machine(SaveVmConfig::default(), &streams);
    populate(&src_m);
    let bytes = save(&mut src);

    assert_eq!(&bytes[..4], &VM_FILE_MAGIC.to_be_bytes());
    assert_eq!(&bytes[4..8], &VM_FILE_VERSION.to_be_bytes());
    assert_eq!(bytes.last(), Some(&SectionType::EOF.0));
    assert_eq!(src_m.logs[0].cleanups.get(), 1);

    let (mut dst, dst_m) = machine(SaveVmConfig::default(), &[(Vec::new(), 1)]);
    load(&mut dst, bytes).unwrap();
    assert_eq!(*dst_m.uart.borrow(), *src_m.uart.borrow());
    assert_eq!(dst_m.ticks.get(), 123_456_789);
    assert_eq!(*dst_m.received[0].borrow(), streams[0].0);
}

#[test]
fn corrupt_magic_fails_without_touching_entities() {
    let (mut src, src_m) = machine(SaveVmConfig::default(), &[]);
    populate(&src_m);
    let mut bytes = save(&mut src);
    bytes[0] ^= 0xff;

    let (mut dst, dst_m) = machine(SaveVmConfig::default(), &[]);
    let err = load(&mut dst, bytes).unwrap_err();
    assert!(matches!(err, MigrationError::BadMagic(_)), "{err:?}");
    assert_eq!(*dst_m.uart.borrow(), Uart::default());
    assert_eq!(dst_m.ticks.get(), 0);
}

#[test]
fn obsolete_and_unknown_versions_are_rejected() {
    let mut registry = Registry::default();
    let mut stream = VM_FILE_MAGIC.to_be_bytes().to_vec();
    stream.extend_from_slice(&2u32.to_be_bytes());
    assert!(matches!(
        load(&mut registry, stream),
        Err(MigrationError::ObsoleteVersion)
    ));

    let mut stream = VM_FILE_MAGIC.to_be_bytes().to_vec();
    stream.extend_from_slice(&9u32.to_be_bytes());
    assert!(matches!(
        load(&mut registry, stream),
        Err(MigrationError::UnsupportedVersion(9))
    ));
}

fn header() -> Vec<u8> {
    let mut stream = VM_FILE_MAGIC.to_be_bytes().to_vec();
    stream.extend_from_slice(&VM_FILE_VERSION.to_be_bytes());
    stream
}

fn full_section_header(section_id: u32, idstr: &str, instance_id: u32, version_id: u32) -> Vec<u8> {
    let mut out = vec![SectionType::FULL.0];
    out.extend_from_slice(&section_id.to_be_bytes());
    out.push(idstr.len() as u8);
    out.extend_from_slice(idstr.as_bytes());
    out.extend_from_slice(&instance_id.to_be_bytes());
    out.extend_from_slice(&version_id.to_be_bytes());
    out
}

#[test]
fn malformed_section_records_are_fatal() {
    let (mut registry, _m) = machine(SaveVmConfig::default(), &[]);

    let mut stream = header();
    stream.push(SectionType::PART.0);
    stream.extend_from_slice(&99u32.to_be_bytes());
    assert!(matches!(
        load(&mut registry, stream),
        Err(MigrationError::UnknownSectionId(99))
    ));

    let mut stream = header();
    stream.push(0x42);
    assert!(matches!(
        load(&mut registry, stream),
        Err(MigrationError::UnknownSectionType(0x42))
    ));

    let mut stream = header();
    stream.extend(full_section_header(0, "hpet", 0, 1));
    assert!(matches!(
        load(&mut registry, stream),
        Err(MigrationError::UnknownEntity { idstr, instance_id: 0 }) if idstr == "hpet"
    ));

    let mut stream = header();
    stream.extend(full_section_header(0, "uart", 0, 3));
    assert!(matches!(
        load(&mut registry, stream),
        Err(MigrationError::EntityVersionTooNew { version_id: 3, supported: 2, .. })
    ));

    // Version 1 is below the schema's minimum and has no legacy loader.
    let mut stream = header();
    stream.extend(full_section_header(0, "uart", 0, 1));
    assert!(matches!(
        load(&mut registry, stream),
        Err(MigrationError::VmState(VmStateError::VersionTooOld { .. }))
    ));

    let mut stream = header();
    stream.extend(full_section_header(0, "uart", 0, 2));
    stream.extend_from_slice(&[0x03, 0x0f]);
    assert!(matches!(
        load(&mut registry, stream),
        Err(MigrationError::Channel(_) | MigrationError::VmState(VmStateError::Channel(_)))
    ));
}

#[test]
fn footers_and_configuration_round_trip() {
    let config = SaveVmConfig {
        send_configuration: true,
        section_footers: true,
        machine_name: "pc-q35".to_string(),
    };
    let streams = vec![(vec![7u8; 100], 30)];
    let (mut src, src_m) = machine(config.clone(), &streams);
    populate(&src_m);
    let bytes = save(&mut src);
    assert_eq!(bytes[8], SectionType::CONFIGURATION.0);

    let (mut dst, dst_m) = machine(config.clone(), &[(Vec::new(), 1)]);
    load(&mut dst, bytes.clone()).unwrap();
    assert_eq!(dst_m.ticks.get(), 123_456_789);
    assert_eq!(*dst_m.received[0].borrow(), streams[0].0);

    let other_machine = SaveVmConfig {
        machine_name: "pc-i440fx".to_string(),
        ..config.clone()
    };
    let (mut dst, _) = machine(other_machine, &[(Vec::new(), 1)]);
    let err = load(&mut dst, bytes.clone()).unwrap_err();
    assert!(
        matches!(err, MigrationError::VmState(VmStateError::Hook { name: "configuration", .. })),
        "{err:?}"
    );

    let (mut plain, plain_m) = machine(SaveVmConfig::default(), &[]);
    populate(&plain_m);
    let plain_bytes = save(&mut plain);
    let (mut dst, _) = machine(config.clone(), &[]);
    assert!(matches!(
        load(&mut dst, plain_bytes),
        Err(MigrationError::ConfigurationMissing)
    ));

    // The last section before EOF is the clock's FULL section: footer tag, then its section id.
    let mut corrupted = bytes;
    let id_at = corrupted.len() - 5;
    assert_eq!(corrupted[id_at - 1], SectionType::FOOTER.0);
    corrupted[id_at + 3] ^= 0x40;
    let (mut dst, _) = machine(config, &[(Vec::new(), 1)]);
    assert!(matches!(
        load(&mut dst, corrupted),
        Err(MigrationError::FooterMismatch { idstr, .. }) if idstr == "clock"
    ));
}

#[test]
fn unmigratable_entity_blocks_save_and_load() {
    let (mut registry, _m) = machine(SaveVmConfig::default(), &[]);
    let bytes = save(&mut registry);

    registry
        .register_vmstate(
            InstanceId::Auto,
            vmstate_passthrough(),
            Rc::new(RefCell::new(Passthrough::default())),
            RegisterOptions::default(),
        )
        .unwrap();

    let mut ch = Channel::new_writer(MemTransport::new());
    assert!(matches!(
        save_vm_state(&mut registry, &mut ch),
        Err(MigrationError::Blocked(idstr)) if idstr == "passthrough"
    ));
    assert!(matches!(
        load(&mut registry, bytes),
        Err(MigrationError::Blocked(_))
    ));
}

struct BrokenPipe;

impl Transport for BrokenPipe {
    fn put_buffer(&mut self, _pos: u64, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "receiver closed"))
    }
}

#[test]
fn transport_failure_cancels_live_entities_once() {
    // The first chunk overflows the channel buffer, so the failure surfaces during setup.
    let streams = vec![(vec![1u8; 48 * 1024], 40 * 1024), (vec![2u8; 16], 8)];
    let (mut registry, m) = machine(SaveVmConfig::default(), &streams);

    let mut ch = Channel::new_writer(BrokenPipe);
    let err = save_vm_state(&mut registry, &mut ch).unwrap_err();
    assert!(matches!(err, MigrationError::Channel(_)), "{err:?}");

    for log in &m.logs {
        assert_eq!(log.cancels.get(), 1);
        assert_eq!(log.cleanups.get(), 1);
        assert_eq!(log.iterations.get(), 0);
    }
}

#[test]
fn device_state_skips_live_entities() {
    let (mut src, src_m) = machine(SaveVmConfig::default(), &[(vec![9u8; 64], 8)]);
    populate(&src_m);

    let file = tempfile::NamedTempFile::new().unwrap();
    let mut ch = Channel::new_writer(WriterTransport::new(file.reopen().unwrap()));
    save_device_state(&mut src, &mut ch).unwrap();
    ch.close().unwrap();
    assert_eq!(src_m.logs[0].setups.get(), 0);

    let bytes = std::fs::read(file.path()).unwrap();
    let (mut dst, dst_m) = machine(SaveVmConfig::default(), &[(Vec::new(), 1)]);
    load(&mut dst, bytes).unwrap();
    assert_eq!(*dst_m.uart.borrow(), *src_m.uart.borrow());
    assert!(dst_m.received[0].borrow().is_empty());
}

#[test]
fn device_path_entity_loads_stream_without_paths() {
    let (mut src, src_m) = machine(SaveVmConfig::default(), &[]);
    populate(&src_m);
    let bytes = save(&mut src);

    let mut dst = Registry::default();
    let uart = Rc::new(RefCell::new(Uart::default()));
    dst.register_vmstate(
        InstanceId::Auto,
        vmstate_uart(),
        uart.clone(),
        RegisterOptions {
            dev_path: Some("isa/0x3f8".to_string()),
            ..RegisterOptions::default()
        },
    )
    .unwrap();
    let ticks = Rc::new(Cell::new(0));
    dst.register_savevm(
        "clock",
        InstanceId::Auto,
        1,
        Box::new(Clock {
            ticks: ticks.clone(),
        }),
        OpaqueId::of(&ticks),
        RegisterOptions::default(),
    )
    .unwrap();
    assert_eq!(dst.entries()[0].idstr(), "isa/0x3f8/uart");

    load(&mut dst, bytes).unwrap();
    assert_eq!(uart.borrow().scratch, 0xdead_beef);
}

struct SyncLog(Rc<RefCell<Vec<&'static str>>>);

impl MachineSync for SyncLog {
    fn synchronize_all_states(&mut self) {
        self.0.borrow_mut().push("states");
    }

    fn synchronize_all_post_init(&mut self) {
        self.0.borrow_mut().push("post_init");
    }
}

#[test]
fn machine_sync_runs_around_save_and_successful_load() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let (mut src, _) = machine(SaveVmConfig::default(), &[]);
    src.set_machine_sync(Box::new(SyncLog(calls.clone())));
    let bytes = save(&mut src);
    assert_eq!(*calls.borrow(), ["states"]);

    let (mut dst, _) = machine(SaveVmConfig::default(), &[]);
    dst.set_machine_sync(Box::new(SyncLog(calls.clone())));
    load(&mut dst, bytes.clone()).unwrap();
    assert_eq!(*calls.borrow(), ["states", "post_init"]);

    let truncated = bytes[..bytes.len() - 1].to_vec();
    assert!(load(&mut dst, truncated).is_err());
    assert_eq!(calls.borrow().len(), 2);
}

#[test]
fn finished_live_entity_does_not_starve_later_ones() {
    // The first stream fits in its setup chunk; the second needs three.
    let streams = vec![(vec![0xaa; 10], 16), ((0..48u8).collect::<Vec<_>>(), 16)];
    let (mut src, src_m) = machine(SaveVmConfig::default(), &streams);

    let mem = MemTransport::new();
    let mut ch = Channel::new_writer(mem.clone());
    ch.set_rate_limit(4);
    savevm_state_begin(&mut src, &mut ch).unwrap();
    let mut calls = 0;
    loop {
        calls += 1;
        assert!(calls <= 10, "iteration never reached the second entity");
        ch.reset_rate_limit();
        if savevm_state_iterate(&mut src, &mut ch).unwrap() == IterationStatus::Complete {
            break;
        }
    }
    assert_eq!(calls, 3);
    assert_eq!(src_m.logs[0].iterations.get(), 1);
    assert_eq!(src_m.logs[1].iterations.get(), 2);

    savevm_state_complete(&mut src, &mut ch).unwrap();
    savevm_state_cleanup(&mut src);
    ch.close().unwrap();

    let (mut dst, dst_m) = machine(SaveVmConfig::default(), &[(Vec::new(), 1), (Vec::new(), 1)]);
    load(&mut dst, mem.contents()).unwrap();
    assert_eq!(*dst_m.received[0].borrow(), streams[0].0);
    assert_eq!(*dst_m.received[1].borrow(), streams[1].0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_interleaving_loads_back(
        streams in proptest::collection::vec(
            (proptest::collection::vec(any::<u8>(), 0..400), 1usize..96),
            0..4,
        ),
        rate_limit in 0u64..256,
        footers in any::<bool>(),
    ) {
        let config = SaveVmConfig { section_footers: footers, ..SaveVmConfig::default() };
        let (mut src, src_m) = machine(config.clone(), &streams);
        populate(&src_m);

        let mem = MemTransport::new();
        let mut ch = Channel::new_writer(mem.clone());
        ch.set_rate_limit(rate_limit);
        savevm_state_begin(&mut src, &mut ch).unwrap();
        loop {
            ch.reset_rate_limit();
            if savevm_state_iterate(&mut src, &mut ch).unwrap() == IterationStatus::Complete {
                break;
            }
        }
        savevm_state_complete(&mut src, &mut ch).unwrap();
        savevm_state_cleanup(&mut src);
        ch.close().unwrap();

        let empty: Vec<_> = streams.iter().map(|_| (Vec::new(), 1)).collect();
        let (mut dst, dst_m) = machine(config, &empty);
        load(&mut dst, mem.contents()).unwrap();
        prop_assert_eq!(&*dst_m.uart.borrow(), &*src_m.uart.borrow());
        for (received, (data, _)) in dst_m.received.iter().zip(&streams) {
            prop_assert_eq!(&*received.borrow(), data);
        }
    }
}
