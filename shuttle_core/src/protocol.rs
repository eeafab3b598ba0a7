//! Persistent execution over four pre-opened byte streams.
//!
//! Wire format, all integers little-endian:
//!
//! | step      | stream        | bytes                          |
//! |-----------|---------------|--------------------------------|
//! | handshake | control-write | `HELO`                         |
//! | handshake | control-read  | `HELO`                         |
//! | command   | control-read  | `exec` (4)                     |
//! | length    | control-read  | payload size (u64)             |
//! | payload   | data-read     | payload bytes                  |
//! | status    | control-write | `(status & 0xff) << 8` (u32)   |
//!
//! Any deviation is fatal. The parent restarts the worker; a desynchronized
//! stream cannot be repaired in place.

use crate::config::ProtocolSettings;
use crate::coverage::EpochReset;
use crate::engine::Engine;
use crate::harness::Harness;
use crate::input::FixedBuffer;
use std::convert::Infallible;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use thiserror::Error;

pub const HANDSHAKE: [u8; 4] = *b"HELO";
pub const EXEC_COMMAND: [u8; 4] = *b"exec";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid handshake from parent: {0:?}")]
    BadHandshake(Vec<u8>),
    #[error("unknown action: {0:#010x}")]
    UnknownCommand(u32),
    #[error("control channel closed")]
    ControlClosed,
    #[error("short read on control channel: expected {expected} bytes, got {got}")]
    ShortControlRead { expected: usize, got: usize },
    #[error("failed to load script: data channel closed with {remaining} bytes outstanding")]
    DataClosed { remaining: usize },
    #[error("short write on control channel: wrote {written} of {expected} bytes")]
    ShortControlWrite { expected: usize, written: usize },
    #[error("protocol I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("protocol file descriptor {fd} is not open: {source}")]
    NotOpen {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
    #[error("failed to mark protocol file descriptor {fd} close-on-exec: {source}")]
    CloseOnExec {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

/// Where the loop currently is; only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingHandshake,
    Ready,
    AwaitingCommand,
    ReceivingPayload,
    Executing,
    ReportingStatus,
}

/// The four protocol streams. `data_write` is part of the fixed layout but
/// the loop itself never writes to it.
pub struct Channels<CR, CW, DR, DW> {
    pub control_read: CR,
    pub control_write: CW,
    pub data_read: DR,
    pub data_write: DW,
}

impl Channels<File, File, File, File> {
    /// Takes ownership of the inherited protocol descriptors and marks them
    /// close-on-exec, so interpreters spawned later never hold the channels.
    ///
    /// # Safety
    /// The descriptors must not be owned by anything else in this process.
    pub unsafe fn from_fds(settings: &ProtocolSettings) -> Result<Self, ChannelError> {
        let fds = [
            settings.control_read_fd,
            settings.control_write_fd,
            settings.data_read_fd,
            settings.data_write_fd,
        ];
        for fd in fds {
            adopt_fd(fd)?;
        }
        unsafe {
            Ok(Self {
                control_read: File::from_raw_fd(settings.control_read_fd),
                control_write: File::from_raw_fd(settings.control_write_fd),
                data_read: File::from_raw_fd(settings.data_read_fd),
                data_write: File::from_raw_fd(settings.data_write_fd),
            })
        }
    }
}

fn adopt_fd(fd: RawFd) -> Result<(), ChannelError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(ChannelError::NotOpen {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(ChannelError::CloseOnExec {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Single read that must deliver the whole field at once.
fn read_control<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let got = loop {
        match reader.read(buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    match got {
        0 => Err(ProtocolError::ControlClosed),
        n if n == buf.len() => Ok(()),
        n => Err(ProtocolError::ShortControlRead {
            expected: buf.len(),
            got: n,
        }),
    }
}

fn write_control<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), ProtocolError> {
    let written = loop {
        match writer.write(bytes) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    if written != bytes.len() {
        return Err(ProtocolError::ShortControlWrite {
            expected: bytes.len(),
            written,
        });
    }
    writer.flush()?;
    Ok(())
}

/// Encodes a harness status the way the fuzzer decodes a wait status.
/// The low byte would carry a signal number and is always zero here.
pub fn encode_status(status: i32) -> [u8; 4] {
    (((status & 0xff) as u32) << 8).to_le_bytes()
}

pub struct PersistentLoop<E, C, CR, CW, DR, DW>
where
    E: Engine,
    C: EpochReset,
{
    channels: Channels<CR, CW, DR, DW>,
    harness: Harness<E>,
    coverage: C,
    input: FixedBuffer,
    state: LoopState,
    executions: u64,
}

impl<E, C, CR, CW, DR, DW> PersistentLoop<E, C, CR, CW, DR, DW>
where
    E: Engine,
    C: EpochReset,
    CR: Read,
    CW: Write,
    DR: Read,
{
    pub fn new(
        channels: Channels<CR, CW, DR, DW>,
        harness: Harness<E>,
        coverage: C,
        input_capacity: usize,
    ) -> Self {
        Self {
            channels,
            harness,
            coverage,
            input: FixedBuffer::with_capacity(input_capacity),
            state: LoopState::AwaitingHandshake,
            executions: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn harness(&self) -> &Harness<E> {
        &self.harness
    }

    pub fn channels(&self) -> &Channels<CR, CW, DR, DW> {
        &self.channels
    }

    fn enter(&mut self, state: LoopState) {
        tracing::trace!(from = ?self.state, to = ?state, "protocol state change");
        self.state = state;
    }

    pub fn handshake(&mut self) -> Result<(), ProtocolError> {
        write_control(&mut self.channels.control_write, &HANDSHAKE)?;

        let mut reply = [0u8; 4];
        let got = self.channels.control_read.read(&mut reply)?;
        if got != reply.len() || reply != HANDSHAKE {
            return Err(ProtocolError::BadHandshake(reply[..got].to_vec()));
        }

        self.enter(LoopState::Ready);
        tracing::debug!("handshake complete");
        Ok(())
    }

    /// Serves exactly one command and returns the status it reported.
    pub fn step(&mut self) -> Result<i32, ProtocolError> {
        self.enter(LoopState::AwaitingCommand);
        let mut action = [0u8; 4];
        read_control(&mut self.channels.control_read, &mut action)?;
        if action != EXEC_COMMAND {
            return Err(ProtocolError::UnknownCommand(u32::from_le_bytes(action)));
        }

        let mut size_bytes = [0u8; 8];
        read_control(&mut self.channels.control_read, &mut size_bytes)?;
        let declared = u64::from_le_bytes(size_bytes);
        let script_size = self.input.clamp(declared);
        if (script_size as u64) < declared {
            tracing::debug!(declared, script_size, "payload truncated to buffer capacity");
        }

        self.enter(LoopState::ReceivingPayload);
        let slot = self.input.prepare(script_size);
        let mut filled = 0;
        while filled < slot.len() {
            match self.channels.data_read.read(&mut slot[filled..]) {
                Ok(0) => {
                    return Err(ProtocolError::DataClosed {
                        remaining: slot.len() - filled,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.enter(LoopState::Executing);
        let status = self.harness.run(self.input.as_bytes());

        // The fuzzer's log capture must see this run's output before the next command.
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        self.enter(LoopState::ReportingStatus);
        write_control(&mut self.channels.control_write, &encode_status(status))?;
        self.coverage.reset_epoch();
        self.executions += 1;

        Ok(status)
    }

    /// Handshakes and then serves commands until the first error.
    pub fn run(&mut self) -> Result<Infallible, ProtocolError> {
        if self.state == LoopState::AwaitingHandshake {
            self.handshake()?;
        }
        loop {
            self.step()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformSettings;
    use crate::coverage::{BitmapSource, CoverageRegistry};
    use crate::engine::Outcome;
    use std::cell::Cell;
    use std::io::Cursor;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RaiseEngine {
        executed: Vec<Vec<u8>>,
    }

    impl Engine for RaiseEngine {
        fn reset_global_state(&mut self) {}

        fn execute(&mut self, source: &[u8]) -> Outcome {
            self.executed.push(source.to_vec());
            if source.windows(5).any(|w| w == b"raise") {
                Outcome::Failure { code: 1 }
            } else {
                Outcome::Success
            }
        }
    }

    #[derive(Default)]
    struct CountingReset {
        resets: Cell<usize>,
    }

    impl EpochReset for CountingReset {
        fn reset_epoch(&self) {
            self.resets.set(self.resets.get() + 1);
        }
    }

    /// Hands out at most `chunk` bytes per read, like a slow pipe.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        chunk: usize,
        reads: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            let n = buf.len().min(self.chunk);
            self.data.read(&mut buf[..n])
        }
    }

    fn control_stream(payload_sizes: &[u64]) -> Vec<u8> {
        let mut bytes = HANDSHAKE.to_vec();
        for size in payload_sizes {
            bytes.extend_from_slice(&EXEC_COMMAND);
            bytes.extend_from_slice(&size.to_le_bytes());
        }
        bytes
    }

    type TestLoop<DR, C> = PersistentLoop<RaiseEngine, C, Cursor<Vec<u8>>, Vec<u8>, DR, Vec<u8>>;

    fn make_loop<DR: Read, C: EpochReset>(
        control: Vec<u8>,
        data: DR,
        coverage: C,
        capacity: usize,
    ) -> TestLoop<DR, C> {
        let channels = Channels {
            control_read: Cursor::new(control),
            control_write: Vec::new(),
            data_read: data,
            data_write: Vec::new(),
        };
        let harness = Harness::new(RaiseEngine::default(), &TransformSettings::default());
        PersistentLoop::new(channels, harness, coverage, capacity)
    }

    fn statuses(written: &[u8]) -> Vec<u32> {
        written[4..]
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn encodes_status_in_second_byte() {
        assert_eq!(encode_status(0), [0, 0, 0, 0]);
        assert_eq!(encode_status(1), [0, 1, 0, 0]);
        assert_eq!(encode_status(0x1ff), [0, 0xff, 0, 0]);
    }

    #[test]
    fn command_word_is_cexe_read_little_endian() {
        let as_multichar = (u32::from(b'c') << 24)
            | (u32::from(b'e') << 16)
            | (u32::from(b'x') << 8)
            | u32::from(b'e');
        assert_eq!(u32::from_le_bytes(EXEC_COMMAND), as_multichar);
    }

    #[test]
    fn n_commands_produce_n_statuses_in_order() {
        let programs: [&[u8]; 3] = [b"print(1)", b"raise Exception()", b"x = 2"];
        let control = control_stream(&programs.map(|p| p.len() as u64));
        let data = Cursor::new(programs.concat());
        let coverage = CountingReset::default();

        let mut persistent = make_loop(control, data, &coverage, 0x10000);
        let err = persistent.run().unwrap_err();
        assert!(matches!(err, ProtocolError::ControlClosed), "got {err:?}");

        let written = &persistent.channels().control_write;
        assert_eq!(&written[..4], b"HELO");
        assert_eq!(statuses(written), vec![0, 1 << 8, 0]);
        assert_eq!(persistent.executions(), 3);
        assert_eq!(coverage.resets.get(), 3, "one coverage reset per execution");
        assert_eq!(
            persistent.harness().engine().executed,
            programs.iter().map(|p| p.to_vec()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn payload_is_normalized_before_execution() {
        let program = b"while True:\nINDENT\nbreak\nDEDENT\n";
        let control = control_stream(&[program.len() as u64]);
        let data = Cursor::new(program.to_vec());
        let mut persistent = make_loop(control, data, CountingReset::default(), 256);
        persistent.handshake().unwrap();
        assert_eq!(persistent.step().unwrap(), 0);
        assert_eq!(
            persistent.harness().engine().executed,
            vec![b"while True:\n    break\n".to_vec()]
        );
    }

    #[test]
    fn handshake_moves_to_ready() {
        let mut persistent =
            make_loop(HANDSHAKE.to_vec(), io::empty(), CountingReset::default(), 16);
        assert_eq!(persistent.state(), LoopState::AwaitingHandshake);
        persistent.handshake().unwrap();
        assert_eq!(persistent.state(), LoopState::Ready);
    }

    #[test]
    fn bad_handshake_is_fatal() {
        let mut persistent = make_loop(b"HELL".to_vec(), io::empty(), CountingReset::default(), 16);
        let err = persistent.run().unwrap_err();
        assert!(matches!(err, ProtocolError::BadHandshake(ref got) if got == b"HELL"));
    }

    #[test]
    fn short_handshake_is_fatal() {
        let mut persistent = make_loop(b"HE".to_vec(), io::empty(), CountingReset::default(), 16);
        let err = persistent.handshake().unwrap_err();
        assert!(matches!(err, ProtocolError::BadHandshake(ref got) if got == b"HE"));
    }

    #[test]
    fn unknown_command_is_fatal() {
        let mut control = HANDSHAKE.to_vec();
        control.extend_from_slice(b"quit");
        control.extend_from_slice(&0u64.to_le_bytes());
        let coverage = CountingReset::default();
        let mut persistent = make_loop(control, io::empty(), &coverage, 16);
        let err = persistent.run().unwrap_err();
        let quit = u32::from_le_bytes(*b"quit");
        assert!(matches!(err, ProtocolError::UnknownCommand(word) if word == quit));
        assert_eq!(persistent.channels().control_write.len(), 4, "no status written");
        assert_eq!(coverage.resets.get(), 0);
    }

    #[test]
    fn short_length_field_is_fatal() {
        let mut control = HANDSHAKE.to_vec();
        control.extend_from_slice(&EXEC_COMMAND);
        control.extend_from_slice(&[1, 0, 0]);
        let mut persistent = make_loop(control, io::empty(), CountingReset::default(), 16);
        let err = persistent.run().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortControlRead {
                expected: 8,
                got: 3
            }
        ));
    }

    #[test]
    fn partial_data_reads_are_retried() {
        let program = b"print('slow producer')\n".to_vec();
        let control = control_stream(&[program.len() as u64]);
        let data = Trickle {
            data: Cursor::new(program.clone()),
            chunk: 3,
            reads: 0,
        };
        let mut persistent = make_loop(control, data, CountingReset::default(), 256);
        persistent.handshake().unwrap();
        assert_eq!(persistent.step().unwrap(), 0);
        assert_eq!(persistent.harness().engine().executed, vec![program.clone()]);
        assert_eq!(persistent.channels().data_read.reads, program.len().div_ceil(3));
    }

    #[test]
    fn data_channel_closing_early_is_fatal() {
        let control = control_stream(&[10]);
        let data = Trickle {
            data: Cursor::new(b"abcd".to_vec()),
            chunk: 2,
            reads: 0,
        };
        let mut persistent = make_loop(control, data, CountingReset::default(), 256);
        let err = persistent.run().unwrap_err();
        assert!(matches!(err, ProtocolError::DataClosed { remaining: 6 }), "got {err:?}");
        assert!(persistent.harness().engine().executed.is_empty());
    }

    #[test]
    fn oversized_payload_is_truncated_to_capacity() {
        let control = control_stream(&[1 << 40]);
        let data = Cursor::new(b"0123456789abcdef".to_vec());
        let mut persistent = make_loop(control, data, CountingReset::default(), 8);
        persistent.handshake().unwrap();
        persistent.step().unwrap();
        assert_eq!(persistent.harness().engine().executed, vec![b"0123456".to_vec()]);
    }

    #[test]
    fn empty_payload_executes_empty_program() {
        let control = control_stream(&[0]);
        let mut persistent = make_loop(control, io::empty(), CountingReset::default(), 16);
        persistent.handshake().unwrap();
        assert_eq!(persistent.step().unwrap(), 0);
        assert_eq!(persistent.harness().engine().executed, vec![Vec::<u8>::new()]);
    }

    /// Two fresh pipes, without close-on-exec, as a parent would hand them over.
    fn inherited_pipe_fds() -> ProtocolSettings {
        let mut control = [0; 2];
        let mut data = [0; 2];
        unsafe {
            assert_eq!(libc::pipe(control.as_mut_ptr()), 0);
            assert_eq!(libc::pipe(data.as_mut_ptr()), 0);
        }
        ProtocolSettings {
            control_read_fd: control[0],
            control_write_fd: control[1],
            data_read_fd: data[0],
            data_write_fd: data[1],
            ..ProtocolSettings::default()
        }
    }

    #[test]
    fn adopted_fds_are_close_on_exec() {
        let settings = inherited_pipe_fds();
        let channels = unsafe { Channels::from_fds(&settings) }.unwrap();
        for file in [
            &channels.control_read,
            &channels.control_write,
            &channels.data_read,
            &channels.data_write,
        ] {
            let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0, "fd {}", file.as_raw_fd());
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn engine_children_do_not_inherit_protocol_fds() {
        use crate::engine::{CommandEngine, CommandEngineConfig, InputDelivery};
        use std::time::Duration;

        let settings = inherited_pipe_fds();
        let channels = unsafe { Channels::from_fds(&settings) }.unwrap();
        let script = format!(
            "for fd in {} {} {} {}; do test -e /proc/self/fd/$fd && exit 9; done; exit 0",
            settings.control_read_fd,
            settings.control_write_fd,
            settings.data_read_fd,
            settings.data_write_fd,
        );
        let mut engine = CommandEngine::new(CommandEngineConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script],
            input_delivery: InputDelivery::StdIn,
            timeout: Duration::from_secs(5),
            working_dir: None,
        });
        assert_eq!(engine.execute(b""), Outcome::Success);
        drop(channels);
    }

    #[test]
    fn closed_fd_is_reported() {
        let inherited = inherited_pipe_fds();
        let settings = ProtocolSettings {
            data_write_fd: -1,
            ..inherited.clone()
        };
        let err = match unsafe { Channels::from_fds(&settings) } {
            Ok(_) => panic!("closed fd accepted"),
            Err(e) => e,
        };
        assert!(matches!(err, ChannelError::NotOpen { fd: -1, .. }), "got {err:?}");
        for fd in [
            inherited.control_read_fd,
            inherited.control_write_fd,
            inherited.data_read_fd,
            inherited.data_write_fd,
        ] {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn coverage_epoch_tracks_each_execution() {
        let guards: &'static [AtomicU32] =
            Box::leak((0..16).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice());
        let registry: &'static CoverageRegistry<'static> =
            Box::leak(Box::new(CoverageRegistry::new(BitmapSource::Private { size: 64 })));
        registry.attach(guards).unwrap();

        // Fires edge k for every digit k and snapshots the bitmap afterwards.
        struct EdgeEngine {
            registry: &'static CoverageRegistry<'static>,
            guards: &'static [AtomicU32],
            seen: Vec<Vec<usize>>,
        }
        impl Engine for EdgeEngine {
            fn reset_global_state(&mut self) {}
            fn execute(&mut self, source: &[u8]) -> Outcome {
                for digit in source.iter().filter(|b| b.is_ascii_digit()) {
                    self.registry.record(&self.guards[(digit - b'0') as usize]);
                }
                let tracker = self.registry.tracker().unwrap();
                self.seen.push(tracker.covered_edges());
                Outcome::Success
            }
        }

        let programs: [&[u8]; 2] = [b"1 3 3", b"2"];
        let control = control_stream(&programs.map(|p| p.len() as u64));
        let channels = Channels {
            control_read: Cursor::new(control),
            control_write: Vec::new(),
            data_read: Cursor::new(programs.concat()),
            data_write: Vec::<u8>::new(),
        };
        let engine = EdgeEngine {
            registry,
            guards,
            seen: Vec::new(),
        };
        let harness = Harness::new(engine, &TransformSettings::default());
        let mut persistent = PersistentLoop::new(channels, harness, registry, 64);
        let tracker = registry.tracker().unwrap();

        persistent.handshake().unwrap();
        persistent.step().unwrap();
        assert!(
            tracker.covered_edges().is_empty(),
            "bitmap cleared once the status went out"
        );
        assert_eq!(guards[1].load(Ordering::Relaxed), 2, "fired slot re-armed");

        persistent.step().unwrap();
        // Slot k holds index k + 1, which maps to bit k.
        assert_eq!(
            persistent.harness().engine().seen,
            vec![vec![1, 3], vec![2]],
            "each run only sees its own edges"
        );
    }
}
