//! Machine identity matching.
//!
//! Caller references, stored machines and provider instances all identify a
//! machine by an optional provider ID and an optional name. Identity is
//! decided by a fixed precedence:
//!
//! 1. both sides carry an ID: the IDs decide, names are ignored;
//! 2. otherwise both sides carry a name: the names decide;
//! 3. otherwise the records do not match.
//!
//! A record with only an ID therefore never matches one with only a name.

/// Anything that can be matched against a machine.
pub trait MachineIdentity {
    /// Provider-assigned machine ID, if known.
    fn machine_id(&self) -> Option<&str>;

    /// Machine name (usually the private DNS name), if known.
    fn name(&self) -> Option<&str>;
}

impl<T: MachineIdentity + ?Sized> MachineIdentity for &T {
    fn machine_id(&self) -> Option<&str> {
        (**self).machine_id()
    }

    fn name(&self) -> Option<&str> {
        (**self).name()
    }
}

/// A bare `(id, name)` pair, for call sites that only hold strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineRef {
    pub machine_id: Option<String>,
    pub name: Option<String>,
}

impl MachineRef {
    pub fn new(machine_id: Option<String>, name: Option<String>) -> Self {
        Self { machine_id, name }
    }

    pub fn from_identity(identity: &impl MachineIdentity) -> Self {
        Self {
            machine_id: present(identity.machine_id()).map(str::to_string),
            name: present(identity.name()).map(str::to_string),
        }
    }
}

impl MachineIdentity for MachineRef {
    fn machine_id(&self) -> Option<&str> {
        self.machine_id.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Treat blank strings as absent.
pub fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// True if the identity carries a usable provider ID.
pub fn has_machine_id(identity: &impl MachineIdentity) -> bool {
    present(identity.machine_id()).is_some()
}

/// Decide whether two records identify the same machine.
pub fn matches(a: &impl MachineIdentity, b: &impl MachineIdentity) -> bool {
    if let (Some(x), Some(y)) = (present(a.machine_id()), present(b.machine_id())) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (present(a.name()), present(b.name())) {
        return x == y;
    }
    false
}

/// Index of the first element of `haystack` matching `needle`.
pub fn find_match<'a, N, H, I>(needle: &N, haystack: I) -> Option<usize>
where
    N: MachineIdentity,
    H: MachineIdentity + 'a,
    I: IntoIterator<Item = &'a H>,
{
    haystack.into_iter().position(|candidate| matches(needle, candidate))
}

/// Split `items` into those matching some reference and those matching none.
pub fn partition_matched<T, R>(items: Vec<T>, refs: &[R]) -> (Vec<T>, Vec<T>)
where
    T: MachineIdentity,
    R: MachineIdentity,
{
    items
        .into_iter()
        .partition(|item| refs.iter().any(|r| matches(item, r)))
}
