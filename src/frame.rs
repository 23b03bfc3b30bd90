use crate::error::{Error, Result};
use crate::value::Handle;

/// One activation record. `base` is the index into the value stack of
/// the callee's first local slot; `adjust` is the number of return
/// values the caller asked for (0 means "all of them", as produced by
/// a trailing multi-value call expression).
pub struct CallInfo {
    pub func: Handle,
    pub pc: usize,
    pub base: usize,
    pub adjust: u8,
    pub name: String,
}

/// The VM's native call stack, mirrored here so a backtrace can be
/// rendered without walking the host's own Rust stack.
pub struct Frames {
    stack: Vec<CallInfo>,
    max_depth: usize,
}

impl Frames {
    pub fn new(max_depth: usize) -> Frames {
        Frames { stack: Vec::new(), max_depth }
    }

    pub fn push(&mut self, info: CallInfo) -> Result<()> {
        if self.stack.len() >= self.max_depth {
            return Err(Error::StackOverflow);
        }
        self.stack.push(info);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<CallInfo> {
        self.stack.pop()
    }

    pub fn current(&self) -> Option<&CallInfo> {
        self.stack.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut CallInfo> {
        self.stack.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn truncate(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    /// A bounded backtrace, innermost frame first, for error triples
    /// and panic formatting.
    pub fn backtrace(&self, window: usize) -> Vec<String> {
        self.stack
            .iter()
            .rev()
            .take(window)
            .map(|f| format!("{} (pc {})", f.name, f.pc))
            .collect()
    }
}

/// A protected-call boundary: the frame depth and stack depth to
/// restore to if the protected region raises. Since this crate models
/// the reference implementation's `setjmp`/`longjmp` pair as ordinary
/// `Result` propagation, "unwinding to the mark" is just truncating
/// back to these depths after an `Err` bubbles up through `?`.
#[derive(Clone, Copy)]
pub struct ProtectedMark {
    pub frame_depth: usize,
    pub stack_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> CallInfo {
        CallInfo { func: 0, pc: 0, base: 0, adjust: 0, name: name.to_owned() }
    }

    #[test]
    fn overflow_is_reported_as_an_error() {
        let mut frames = Frames::new(2);
        frames.push(info("a")).unwrap();
        frames.push(info("b")).unwrap();
        assert!(matches!(frames.push(info("c")), Err(Error::StackOverflow)));
    }

    #[test]
    fn truncate_restores_a_protected_mark() {
        let mut frames = Frames::new(8);
        frames.push(info("a")).unwrap();
        let mark = ProtectedMark { frame_depth: frames.depth(), stack_depth: 0 };
        frames.push(info("b")).unwrap();
        frames.push(info("c")).unwrap();
        frames.truncate(mark.frame_depth);
        assert_eq!(frames.depth(), 1);
    }
}
