use std::ffi::c_void;

use crate::value::Handle;

/// Host-supplied cleanup callback, invoked once by the collector's
/// `Finalize` phase when a managed object becomes unreachable.
pub type Finalizer = fn(*mut c_void);

/// Host-owned opaque data (`mand`). The VM never interprets `data`
/// itself; scripts interact with it only through the optional
/// metatable, which resolves field reads/writes the same way a hash
/// map or skip list would.
pub struct Mand {
    data: *mut c_void,
    finalizer: Option<Finalizer>,
    metatable: Option<Handle>,
}

impl Mand {
    pub fn new(data: *mut c_void, finalizer: Option<Finalizer>) -> Mand {
        Mand { data, finalizer, metatable: None }
    }

    pub fn data(&self) -> *mut c_void {
        self.data
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    pub fn finalize(&self) {
        if let Some(f) = self.finalizer {
            f(self.data);
        }
    }

    pub fn metatable(&self) -> Option<Handle> {
        self.metatable
    }

    pub fn set_metatable(&mut self, h: Option<Handle>) {
        self.metatable = h;
    }

    pub fn children(&self, out: &mut Vec<Handle>) {
        if let Some(h) = self.metatable {
            out.push(h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::ptr;

    thread_local! {
        static FINALIZED: Cell<bool> = Cell::new(false);
    }

    fn mark_finalized(_: *mut c_void) {
        FINALIZED.with(|f| f.set(true));
    }

    #[test]
    fn finalizer_runs_on_demand() {
        let m = Mand::new(ptr::null_mut(), Some(mark_finalized));
        assert!(m.has_finalizer());
        m.finalize();
        FINALIZED.with(|f| assert!(f.get()));
    }

    #[test]
    fn metatable_forwarding_is_opt_in() {
        let mut m = Mand::new(ptr::null_mut(), None);
        assert_eq!(m.metatable(), None);
        m.set_metatable(Some(7));
        assert_eq!(m.metatable(), Some(7));
    }
}
