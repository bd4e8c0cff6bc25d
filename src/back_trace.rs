use crate::symbolize::SymbolTable;

/// Maximum number of return addresses kept per stack.
pub const MAX_BT_LEN: usize = 12;

/// A fixed-depth kernel call stack used as the aggregation key.
///
/// Slots after the real depth are zero. Ordering is lexicographic over the
/// whole array, padding included, so two traces are equal only when every slot
/// matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackTrace {
    trace: [u64; MAX_BT_LEN],
}

#[inline]
fn is_sentinel(addr: u64) -> bool {
    addr == 0 || addr == u64::MAX
}

impl BackTrace {
    /// Copy up to [`MAX_BT_LEN`] addresses, zero-padding the rest.
    pub fn from_raw(addresses: &[u64]) -> Self {
        let mut trace = [0u64; MAX_BT_LEN];
        let len = addresses.len().min(MAX_BT_LEN);
        trace[..len].copy_from_slice(&addresses[..len]);
        BackTrace { trace }
    }

    pub fn addresses(&self) -> &[u64; MAX_BT_LEN] {
        &self.trace
    }

    /// Number of slots before the first sentinel.
    pub fn depth(&self) -> usize {
        self.trace
            .iter()
            .position(|&addr| is_sentinel(addr))
            .unwrap_or(MAX_BT_LEN)
    }

    /// Render the stack as space separated function names.
    ///
    /// Stops at the first sentinel slot, at the first address the symbol table
    /// cannot resolve, or at the first name that would not fit in `max_len`
    /// bytes.
    pub fn render_symbolic(&self, symbols: &SymbolTable, max_len: usize) -> String {
        let mut out = String::new();
        for &addr in self.trace.iter() {
            if is_sentinel(addr) {
                break;
            }
            let Some(name) = symbols.lookup(addr) else {
                tracing::warn!("Could not translate {:x}", addr);
                break;
            };
            let sep = usize::from(!out.is_empty());
            if out.len() + sep + name.len() > max_len {
                break;
            }
            if sep == 1 {
                out.push(' ');
            }
            out.push_str(name);
        }
        out
    }
}

impl From<[u64; MAX_BT_LEN]> for BackTrace {
    fn from(trace: [u64; MAX_BT_LEN]) -> Self {
        BackTrace { trace }
    }
}
