//! Interpreters linked into this process.
//!
//! An embedded interpreter keeps its runtime alive across executions, so
//! persistent mode pays the start-up cost once and the interpreter's own
//! instrumentation feeds the coverage callbacks of this binary.

use crate::engine::{Engine, Outcome};

/// The driver interface an embedded interpreter exposes.
pub trait Interpreter {
    /// Brings the runtime up. Called once, before the first program.
    fn initialize(&mut self);

    /// Runs one program and returns 0 on success.
    ///
    /// `terminated` ends with a NUL byte that is not part of the program.
    fn test_one_input(&mut self, terminated: &[u8]) -> i32;

    /// Tears the runtime down. Called once, after the last program.
    fn finalize(&mut self);
}

/// Runs programs on an [`Interpreter`] that lives as long as the engine.
pub struct EmbeddedEngine<I: Interpreter> {
    interpreter: I,
    terminated: Vec<u8>,
}

impl<I: Interpreter> EmbeddedEngine<I> {
    /// Initializes `interpreter`; it is finalized when the engine drops.
    pub fn new(mut interpreter: I) -> Self {
        interpreter.initialize();
        tracing::debug!("embedded interpreter initialized");
        Self {
            interpreter,
            terminated: Vec::new(),
        }
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }
}

impl<I: Interpreter> Engine for EmbeddedEngine<I> {
    // Drivers run every program in a fresh global scope of their own.
    fn reset_global_state(&mut self) {}

    fn execute(&mut self, source: &[u8]) -> Outcome {
        self.terminated.clear();
        self.terminated.reserve(source.len() + 1);
        self.terminated.extend_from_slice(source);
        self.terminated.push(0);

        match self.interpreter.test_one_input(&self.terminated) {
            0 => Outcome::Success,
            code => Outcome::Failure { code },
        }
    }
}

impl<I: Interpreter> Drop for EmbeddedEngine<I> {
    fn drop(&mut self) {
        self.interpreter.finalize();
        tracing::debug!("embedded interpreter finalized");
    }
}

#[cfg(feature = "fuzzir")]
pub use linked::LinkedFuzzir;

#[cfg(feature = "fuzzir")]
mod linked {
    use super::Interpreter;
    use std::ffi::{CString, c_char, c_int};
    use std::sync::atomic::{AtomicBool, Ordering};

    unsafe extern "C" {
        fn fuzzir_initialize(argc: *mut c_int, argv: *mut *mut *mut c_char);
        fn fuzzir_finalize();
        fn fuzzir_test_one_input(data: *const c_char, size: usize) -> c_int;
    }

    static CLAIMED: AtomicBool = AtomicBool::new(false);

    /// The FuzzIR driver linked into this binary.
    ///
    /// Drivers keep process-global interpreter state, so at most one handle
    /// exists per process.
    pub struct LinkedFuzzir {
        program: CString,
        argv: [*mut c_char; 2],
    }

    impl LinkedFuzzir {
        /// Returns the handle unless it was already claimed.
        ///
        /// Only `program` is passed on as `argv`. Drivers treat a second
        /// argument as a file to run once and exit.
        pub fn claim(program: &str) -> Option<Self> {
            if CLAIMED.swap(true, Ordering::AcqRel) {
                return None;
            }
            let program = CString::new(program.replace('\0', "")).unwrap_or_default();
            Some(Self {
                program,
                argv: [std::ptr::null_mut(); 2],
            })
        }
    }

    impl Interpreter for LinkedFuzzir {
        fn initialize(&mut self) {
            self.argv = [self.program.as_ptr().cast_mut(), std::ptr::null_mut()];
            let mut argc: c_int = 1;
            let mut argv = self.argv.as_mut_ptr();
            unsafe { fuzzir_initialize(&mut argc, &mut argv) };
        }

        fn test_one_input(&mut self, terminated: &[u8]) -> i32 {
            let size = terminated.len().saturating_sub(1);
            unsafe { fuzzir_test_one_input(terminated.as_ptr().cast::<c_char>(), size) }
        }

        fn finalize(&mut self) {
            unsafe { fuzzir_finalize() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformSettings;
    use crate::harness::Harness;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct Calls {
        initialized: usize,
        finalized: usize,
        inputs: Vec<Vec<u8>>,
    }

    /// Records every program and fails on `raise`.
    struct FakeInterpreter {
        calls: Rc<RefCell<Calls>>,
    }

    impl Interpreter for FakeInterpreter {
        fn initialize(&mut self) {
            self.calls.borrow_mut().initialized += 1;
        }

        fn test_one_input(&mut self, terminated: &[u8]) -> i32 {
            assert_eq!(terminated.last(), Some(&0), "program is NUL terminated");
            let program = &terminated[..terminated.len() - 1];
            self.calls.borrow_mut().inputs.push(program.to_vec());
            i32::from(program.windows(5).any(|w| w == b"raise"))
        }

        fn finalize(&mut self) {
            self.calls.borrow_mut().finalized += 1;
        }
    }

    fn engine() -> (EmbeddedEngine<FakeInterpreter>, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let engine = EmbeddedEngine::new(FakeInterpreter {
            calls: Rc::clone(&calls),
        });
        (engine, calls)
    }

    #[test]
    fn initialized_once_and_finalized_on_drop() {
        let (mut engine, calls) = engine();
        assert_eq!(calls.borrow().initialized, 1);
        engine.execute(b"print(1)\n");
        engine.execute(b"print(2)\n");
        assert_eq!(calls.borrow().initialized, 1, "runtime survives executions");
        assert_eq!(calls.borrow().finalized, 0);

        drop(engine);
        assert_eq!(calls.borrow().finalized, 1);
    }

    #[test]
    fn return_value_becomes_outcome() {
        let (mut engine, _calls) = engine();
        assert_eq!(engine.execute(b"print('hello')\n"), Outcome::Success);
        assert_eq!(
            engine.execute(b"raise Exception('hello')\n"),
            Outcome::Failure { code: 1 }
        );
    }

    #[test]
    fn shorter_program_after_longer_one_is_not_padded() {
        let (mut engine, calls) = engine();
        engine.execute(b"a = 1; print(a)\n");
        engine.execute(b"x\n");
        engine.execute(b"");
        assert_eq!(
            calls.borrow().inputs,
            vec![b"a = 1; print(a)\n".to_vec(), b"x\n".to_vec(), Vec::new()]
        );
    }

    #[test]
    fn harness_drives_embedded_engine() {
        let (engine, calls) = engine();
        let mut harness = Harness::new(engine, &TransformSettings::default());
        assert_eq!(harness.run(b"try:\nINDENT\nraise Exception()\nDEDENT\n"), 1);
        assert_eq!(harness.run(b"print(1)\n"), 0);
        assert_eq!(
            calls.borrow().inputs[0],
            b"try:\n    raise Exception()\n".to_vec()
        );
        drop(harness);
        assert_eq!(calls.borrow().finalized, 1);
    }
}
