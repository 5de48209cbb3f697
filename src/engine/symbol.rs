//! Host symbols and handles
//!
//! A host member is named by a [`SymbolRef`]: owner type, member name, kind
//! and an optional signature used to pick between overloads. Looking one up
//! through a [`SymbolTable`] yields [`Candidate`]s; the resolver turns the
//! chosen candidate into a [`Handle`], which is what the rest of the engine
//! holds on to.
//!
//! A handle may be null. Null means "this host build does not have that
//! member" and every consumer treats it as "feature unavailable".

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::HostFault;
use super::intercept::MethodSlot;
use super::value::{Args, HostValue};

/// What kind of member a symbol names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Field,
    Property,
    Method,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Field => f.write_str("field"),
            SymbolKind::Property => f.write_str("property"),
            SymbolKind::Method => f.write_str("method"),
        }
    }
}

/// Parameter list of a method overload, normalized to `(a,b,c)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(Arc<str>);

impl Signature {
    pub fn new(params: &[&str]) -> Self {
        Signature(Arc::from(format!("({})", params.join(","))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a host member
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolRef {
    pub owner: Arc<str>,
    pub name: Arc<str>,
    pub kind: SymbolKind,
    pub signature: Option<Signature>,
}

impl SymbolRef {
    pub fn field(owner: &str, name: &str) -> Self {
        Self::new(owner, name, SymbolKind::Field, None)
    }

    pub fn property(owner: &str, name: &str) -> Self {
        Self::new(owner, name, SymbolKind::Property, None)
    }

    /// A method, with no overload preference.
    pub fn method(owner: &str, name: &str) -> Self {
        Self::new(owner, name, SymbolKind::Method, None)
    }

    /// A specific method overload.
    pub fn method_sig(owner: &str, name: &str, params: &[&str]) -> Self {
        Self::new(owner, name, SymbolKind::Method, Some(Signature::new(params)))
    }

    fn new(owner: &str, name: &str, kind: SymbolKind, signature: Option<Signature>) -> Self {
        Self {
            owner: Arc::from(owner),
            name: Arc::from(name),
            kind,
            signature,
        }
    }
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.name)?;
        if let Some(sig) = &self.signature {
            write!(f, "{}", sig)?;
        }
        Ok(())
    }
}

pub type GetterFn = Arc<dyn Fn(&HostValue) -> Result<HostValue, HostFault> + Send + Sync>;
pub type SetterFn = Arc<dyn Fn(&HostValue, HostValue) -> Result<(), HostFault> + Send + Sync>;

/// Read/write access to a field or property of a host type
#[derive(Clone)]
pub struct Accessor {
    get: GetterFn,
    set: Option<SetterFn>,
}

impl Accessor {
    pub fn new<G, S>(get: G, set: S) -> Self
    where
        G: Fn(&HostValue) -> Result<HostValue, HostFault> + Send + Sync + 'static,
        S: Fn(&HostValue, HostValue) -> Result<(), HostFault> + Send + Sync + 'static,
    {
        Self {
            get: Arc::new(get),
            set: Some(Arc::new(set)),
        }
    }

    pub fn read_only<G>(get: G) -> Self
    where
        G: Fn(&HostValue) -> Result<HostValue, HostFault> + Send + Sync + 'static,
    {
        Self {
            get: Arc::new(get),
            set: None,
        }
    }

    pub fn get(&self, receiver: &HostValue) -> Result<HostValue, HostFault> {
        (self.get)(receiver)
    }

    pub fn set(&self, receiver: &HostValue, value: HostValue) -> Result<(), HostFault> {
        match &self.set {
            Some(set) => set(receiver, value),
            None => Err(HostFault::new("member is read-only")),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.set.is_some()
    }
}

/// A resolved host member
#[derive(Clone)]
pub enum Member {
    Field(Accessor),
    Property(Accessor),
    Method(Arc<MethodSlot>),
}

impl Member {
    pub fn kind(&self) -> SymbolKind {
        match self {
            Member::Field(_) => SymbolKind::Field,
            Member::Property(_) => SymbolKind::Property,
            Member::Method(_) => SymbolKind::Method,
        }
    }
}

/// One overload (or the single definition) returned by a table lookup
#[derive(Clone)]
pub struct Candidate {
    pub signature: Option<Signature>,
    pub member: Member,
}

/// Name-based view of the host's members
///
/// Implementations wrap whatever reflection the host offers. The engine only
/// ever asks for members by name and never assumes they exist.
pub trait SymbolTable: Send + Sync {
    /// Every member of `owner` called `name` with the given kind, in the
    /// order the host reports them.
    fn lookup(&self, owner: &str, name: &str, kind: SymbolKind) -> Vec<Candidate>;
}

struct Binding {
    symbol: SymbolRef,
    member: Member,
}

#[derive(Clone, Default)]
enum HandleState {
    #[default]
    Null,
    /// Null, but remembers what was asked for
    Unresolved(Arc<SymbolRef>),
    Bound(Arc<Binding>),
}

/// A resolved member, or the null handle
///
/// Cloning is cheap; all clones point at the same binding.
#[derive(Clone, Default)]
pub struct Handle {
    state: HandleState,
}

impl Handle {
    pub fn null() -> Self {
        Self {
            state: HandleState::Null,
        }
    }

    pub(crate) fn unresolved(symbol: SymbolRef) -> Self {
        Self {
            state: HandleState::Unresolved(Arc::new(symbol)),
        }
    }

    pub(crate) fn bound(symbol: SymbolRef, member: Member) -> Self {
        Self {
            state: HandleState::Bound(Arc::new(Binding { symbol, member })),
        }
    }

    pub fn is_null(&self) -> bool {
        !matches!(self.state, HandleState::Bound(_))
    }

    /// The symbol this handle was resolved from, if known.
    pub fn symbol(&self) -> Option<&SymbolRef> {
        match &self.state {
            HandleState::Null => None,
            HandleState::Unresolved(symbol) => Some(symbol),
            HandleState::Bound(b) => Some(&b.symbol),
        }
    }

    pub fn member(&self) -> Option<&Member> {
        match &self.state {
            HandleState::Bound(b) => Some(&b.member),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<&Arc<MethodSlot>> {
        match self.member()? {
            Member::Method(slot) => Some(slot),
            _ => None,
        }
    }

    fn accessor(&self) -> Result<&Accessor, HostFault> {
        match self.member() {
            Some(Member::Field(a)) | Some(Member::Property(a)) => Ok(a),
            Some(Member::Method(_)) => Err(HostFault::new("handle is a method, not a value")),
            None => Err(HostFault::new("null handle")),
        }
    }

    /// Read a field or property from `receiver`.
    pub fn read(&self, receiver: &HostValue) -> Result<HostValue, HostFault> {
        self.accessor()?.get(receiver)
    }

    /// Write a field or property on `receiver`.
    pub fn write(&self, receiver: &HostValue, value: HostValue) -> Result<(), HostFault> {
        self.accessor()?.set(receiver, value)
    }

    /// Call a method through its interception chain.
    pub fn invoke(&self, receiver: &HostValue, args: &mut Args) -> Result<HostValue, HostFault> {
        match self.method() {
            Some(slot) => slot.invoke(receiver, args),
            None => Err(HostFault::new("handle is not a method")),
        }
    }

    /// Whether two handles share one binding.
    pub fn same_binding(&self, other: &Handle) -> bool {
        match (&self.state, &other.state) {
            (HandleState::Bound(a), HandleState::Bound(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            HandleState::Bound(b) => write!(f, "Handle({} {})", b.member.kind(), b.symbol),
            HandleState::Unresolved(s) => write!(f, "Handle(null, unresolved {})", s),
            HandleState::Null => f.write_str("Handle(null)"),
        }
    }
}

/// In-memory symbol table
///
/// Host adapters publish members here as the host finishes loading its types.
/// Overloads of a method keep their registration order, which is the order
/// `lookup` reports them in.
#[derive(Default)]
pub struct MemberTable {
    members: RwLock<HashMap<(String, String), Vec<Candidate>>>,
}

impl fmt::Debug for MemberTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberTable")
            .field("member_count", &self.members.read().len())
            .finish()
    }
}

impl MemberTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, owner: &str, name: &str, candidate: Candidate) {
        self.members
            .write()
            .entry((owner.to_string(), name.to_string()))
            .or_default()
            .push(candidate);
    }

    pub fn add_field(&self, owner: &str, name: &str, accessor: Accessor) {
        self.push(
            owner,
            name,
            Candidate {
                signature: None,
                member: Member::Field(accessor),
            },
        );
    }

    pub fn add_property(&self, owner: &str, name: &str, accessor: Accessor) {
        self.push(
            owner,
            name,
            Candidate {
                signature: None,
                member: Member::Property(accessor),
            },
        );
    }

    /// Publish a method overload and return its slot so the host side can
    /// route calls through it.
    pub fn add_method(
        &self,
        owner: &str,
        name: &str,
        params: &[&str],
        slot: MethodSlot,
    ) -> Arc<MethodSlot> {
        let slot = Arc::new(slot);
        self.push(
            owner,
            name,
            Candidate {
                signature: Some(Signature::new(params)),
                member: Member::Method(Arc::clone(&slot)),
            },
        );
        slot
    }

    pub fn len(&self) -> usize {
        self.members.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SymbolTable for MemberTable {
    fn lookup(&self, owner: &str, name: &str, kind: SymbolKind) -> Vec<Candidate> {
        let members = self.members.read();
        match members.get(&(owner.to_string(), name.to_string())) {
            Some(candidates) => candidates
                .iter()
                .filter(|c| c.member.kind() == kind)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}
