//! Host value model
//!
//! The scripting host owns its values; this module models just enough of
//! them for the codec: primitives, tables with identity, and functions that
//! are either scripted closures (code blob plus captured upvalues) or native
//! callables.
//!
//! Values are `Rc`-based and stay inside one execution context. They move
//! between actors only as encoded bytes.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

/// Host type tags, as written on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Nil = 0,
    Boolean = 1,
    LightUserdata = 2,
    Number = 3,
    String = 4,
    Table = 5,
    Function = 6,
    Userdata = 7,
    Thread = 8,
}

impl TypeTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => TypeTag::Nil,
            1 => TypeTag::Boolean,
            2 => TypeTag::LightUserdata,
            3 => TypeTag::Number,
            4 => TypeTag::String,
            5 => TypeTag::Table,
            6 => TypeTag::Function,
            7 => TypeTag::Userdata,
            8 => TypeTag::Thread,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Nil => "nil",
            TypeTag::Boolean => "boolean",
            TypeTag::LightUserdata => "lightuserdata",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::Table => "table",
            TypeTag::Function => "function",
            TypeTag::Userdata => "userdata",
            TypeTag::Thread => "thread",
        }
    }
}

/// A host value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    LightUserdata(usize),
    Number(f64),
    String(Vec<u8>),
    Table(TableRef),
    Function(FunctionRef),
    Userdata(Opaque),
    Thread(Opaque),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::String(s.as_bytes().to_vec())
    }

    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Nil => TypeTag::Nil,
            Value::Boolean(_) => TypeTag::Boolean,
            Value::LightUserdata(_) => TypeTag::LightUserdata,
            Value::Number(_) => TypeTag::Number,
            Value::String(_) => TypeTag::String,
            Value::Table(_) => TypeTag::Table,
            Value::Function(_) => TypeTag::Function,
            Value::Userdata(_) => TypeTag::Userdata,
            Value::Thread(_) => TypeTag::Thread,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.tag().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Raw equality: primitives by value, reference types by identity.
    /// This is the key equality tables use.
    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::LightUserdata(a), Value::LightUserdata(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Userdata(a), Value::Userdata(b)) => a.ptr_eq(b),
            (Value::Thread(a), Value::Thread(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Structural equality, used to compare a value with its decoded copy.
    ///
    /// Tables compare entry by entry in enumeration order; closures compare
    /// code bytes and captured upvalues. Cycles are handled by assuming a
    /// pair already under comparison is equal.
    pub fn deep_eq(&self, other: &Value) -> bool {
        deep_eq(self, other, &mut HashSet::new())
    }
}

fn deep_eq(a: &Value, b: &Value, visiting: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Table(x), Value::Table(y)) => {
            if !visiting.insert((x.identity() as usize, y.identity() as usize)) {
                return true;
            }
            let (xs, ys) = (x.pairs(), y.pairs());
            xs.len() == ys.len()
                && xs.iter().zip(ys.iter()).all(|((xk, xv), (yk, yv))| {
                    deep_eq(xk, yk, visiting) && deep_eq(xv, yv, visiting)
                })
        }
        (Value::Function(x), Value::Function(y)) => {
            if !visiting.insert((x.identity() as usize, y.identity() as usize)) {
                return true;
            }
            match (x.as_closure(), y.as_closure()) {
                (Some(cx), Some(cy)) => {
                    let (ux, uy) = (cx.upvalues(), cy.upvalues());
                    let n = ux.len().max(uy.len());
                    cx.code() == cy.code()
                        && (0..n).all(|i| {
                            let l = ux.get(i).cloned().unwrap_or_default();
                            let r = uy.get(i).cloned().unwrap_or_default();
                            deep_eq(&l, &r, visiting)
                        })
                }
                _ => x.ptr_eq(y),
            }
        }
        _ => a.raw_eq(b),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_eq(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::LightUserdata(p) => write!(f, "lightuserdata: {:#x}", p),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            Value::Table(t) => write!(f, "{:?}", t),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Userdata(o) => write!(f, "userdata: {:p}", o.identity()),
            Value::Thread(o) => write!(f, "thread: {:p}", o.identity()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into_bytes())
    }
}

impl From<TableRef> for Value {
    fn from(t: TableRef) -> Self {
        Value::Table(t)
    }
}

impl From<FunctionRef> for Value {
    fn from(f: FunctionRef) -> Self {
        Value::Function(f)
    }
}

/// Opaque host handle (userdata, thread). Never crosses contexts.
#[derive(Clone)]
pub struct Opaque(Rc<dyn Any>);

impl Opaque {
    pub fn new<T: Any>(value: T) -> Self {
        Opaque(Rc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn identity(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

/// Hashable form of a table key, agreeing with [`Value::raw_eq`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RawKey {
    Boolean(bool),
    LightUserdata(usize),
    /// Bit pattern, with -0.0 folded into 0.0
    Number(u64),
    String(Vec<u8>),
    Object(TypeTag, usize),
}

impl RawKey {
    /// `None` for keys a table cannot hold: nil and NaN
    fn of(key: &Value) -> Option<Self> {
        Some(match key {
            Value::Nil => return None,
            Value::Number(n) if n.is_nan() => return None,
            Value::Boolean(b) => RawKey::Boolean(*b),
            Value::LightUserdata(p) => RawKey::LightUserdata(*p),
            Value::Number(n) => RawKey::number(*n),
            Value::String(s) => RawKey::String(s.clone()),
            Value::Table(t) => RawKey::Object(TypeTag::Table, t.identity() as usize),
            Value::Function(f) => RawKey::Object(TypeTag::Function, f.identity() as usize),
            Value::Userdata(o) => RawKey::Object(TypeTag::Userdata, o.identity() as usize),
            Value::Thread(o) => RawKey::Object(TypeTag::Thread, o.identity() as usize),
        })
    }

    fn number(n: f64) -> Self {
        RawKey::Number(if n == 0.0 { 0 } else { n.to_bits() })
    }

    fn index(n: usize) -> Self {
        RawKey::number(n as f64)
    }
}

/// Table storage. Entries are kept in insertion order, which is the
/// enumeration order `pairs` reports.
#[derive(Default)]
struct Table {
    entries: Vec<(Value, Value)>,
    /// Key → slot in `entries`
    slots: HashMap<RawKey, usize>,
    /// Largest n with keys 1..=n all present
    border: usize,
}

impl Table {
    fn slot(&self, key: &Value) -> Option<usize> {
        RawKey::of(key).and_then(|raw| self.slots.get(&raw).copied())
    }

    fn insert(&mut self, raw: RawKey, key: Value, value: Value) {
        self.slots.insert(raw, self.entries.len());
        self.entries.push((key, value));
        while self.slots.contains_key(&RawKey::index(self.border + 1)) {
            self.border += 1;
        }
    }

    fn remove(&mut self, raw: &RawKey, slot: usize) {
        let (key, _) = self.entries.remove(slot);
        self.slots.remove(raw);
        for s in self.slots.values_mut() {
            if *s > slot {
                *s -= 1;
            }
        }
        if let Some(n) = key.as_number() {
            if n.fract() == 0.0 && n >= 1.0 && n <= self.border as f64 {
                self.border = n as usize - 1;
            }
        }
    }
}

/// Shared handle to a host table
#[derive(Clone, Default)]
pub struct TableRef(Rc<RefCell<Table>>);

impl TableRef {
    pub fn new() -> Self {
        TableRef::default()
    }

    /// Build a sequence table `{1 = v1, 2 = v2, ...}`
    pub fn from_list(values: impl IntoIterator<Item = Value>) -> Self {
        let table = TableRef::new();
        for v in values {
            table.push(v);
        }
        table
    }

    pub fn get(&self, key: &Value) -> Value {
        let table = self.0.borrow();
        table
            .slot(key)
            .map(|i| table.entries[i].1.clone())
            .unwrap_or_default()
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.get(&Value::str(key))
    }

    /// Raw set. A nil value removes the key; a nil or NaN key is ignored.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) {
        let (key, value) = (key.into(), value.into());
        let Some(raw) = RawKey::of(&key) else {
            return;
        };
        let mut table = self.0.borrow_mut();
        match (table.slots.get(&raw).copied(), value.is_nil()) {
            (Some(i), true) => table.remove(&raw, i),
            (Some(i), false) => table.entries[i].1 = value,
            (None, true) => {}
            (None, false) => table.insert(raw, key, value),
        }
    }

    /// Length of the sequence part: the largest n with 1..=n all present
    pub fn len(&self) -> usize {
        self.0.borrow().border
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().entries.is_empty()
    }

    pub fn push(&self, value: impl Into<Value>) {
        let n = self.len();
        self.set(Value::Number((n + 1) as f64), value);
    }

    /// Snapshot of the entries in enumeration order
    pub fn pairs(&self) -> Vec<(Value, Value)> {
        self.0.borrow().entries.clone()
    }

    pub fn ptr_eq(&self, other: &TableRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table: {:p}", self.identity())
    }
}

/// Native callable signature
pub type NativeFn = fn(&[Value]) -> Vec<Value>;

pub struct NativeFunction {
    name: String,
    func: NativeFn,
}

impl NativeFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> Vec<Value> {
        (self.func)(args)
    }
}

/// A scripted closure: its compiled code and captured variables
pub struct Closure {
    code: Vec<u8>,
    upvalues: RefCell<Vec<Value>>,
}

impl Closure {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn upvalues(&self) -> Vec<Value> {
        self.upvalues.borrow().clone()
    }
}

pub enum Function {
    Closure(Closure),
    Native(NativeFunction),
}

/// Shared handle to a host function
#[derive(Clone)]
pub struct FunctionRef(Rc<Function>);

impl FunctionRef {
    pub fn closure(code: impl Into<Vec<u8>>, upvalues: Vec<Value>) -> Self {
        FunctionRef(Rc::new(Function::Closure(Closure {
            code: code.into(),
            upvalues: RefCell::new(upvalues),
        })))
    }

    pub fn native(name: impl Into<String>, func: NativeFn) -> Self {
        FunctionRef(Rc::new(Function::Native(NativeFunction {
            name: name.into(),
            func,
        })))
    }

    pub fn as_closure(&self) -> Option<&Closure> {
        match &*self.0 {
            Function::Closure(c) => Some(c),
            Function::Native(_) => None,
        }
    }

    pub fn as_native(&self) -> Option<&NativeFunction> {
        match &*self.0 {
            Function::Native(n) => Some(n),
            Function::Closure(_) => None,
        }
    }

    /// Number of upvalues (0 for native functions)
    pub fn upvalue_count(&self) -> usize {
        self.as_closure().map_or(0, |c| c.upvalues.borrow().len())
    }

    /// Upvalue `n`, numbered from 1 as the host numbers them
    pub fn upvalue(&self, n: usize) -> Value {
        self.as_closure()
            .and_then(|c| n.checked_sub(1).and_then(|i| c.upvalues.borrow().get(i).cloned()))
            .unwrap_or_default()
    }

    /// Rebind upvalue `n` (from 1), growing the list with nils as needed.
    /// Ignored for native functions.
    pub fn set_upvalue(&self, n: usize, value: Value) {
        let Some(closure) = self.as_closure() else {
            return;
        };
        let Some(i) = n.checked_sub(1) else {
            return;
        };
        let mut upvalues = closure.upvalues.borrow_mut();
        if upvalues.len() <= i {
            upvalues.resize(i + 1, Value::Nil);
        }
        upvalues[i] = value;
    }

    pub fn ptr_eq(&self, other: &FunctionRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            Function::Native(n) => write!(f, "native function '{}': {:p}", n.name, self.identity()),
            Function::Closure(_) => write!(f, "function: {:p}", self.identity()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_set_get_remove() {
        let t = TableRef::new();
        t.set("a", 1);
        t.set("b", 2);
        assert_eq!(t.get_str("a"), Value::from(1));

        t.set("a", Value::Nil);
        assert!(t.get_str("a").is_nil());
        assert_eq!(t.pairs().len(), 1);

        t.set(Value::Nil, 3);
        assert_eq!(t.pairs().len(), 1);
    }

    #[test]
    fn test_table_keys_use_identity() {
        let k1 = TableRef::new();
        let k2 = TableRef::new();
        let t = TableRef::new();
        t.set(k1.clone(), "one");
        t.set(k2.clone(), "two");

        assert_eq!(t.get(&Value::Table(k1)), Value::str("one"));
        assert_eq!(t.get(&Value::Table(k2)), Value::str("two"));
        assert!(t.get(&Value::Table(TableRef::new())).is_nil());
    }

    #[test]
    fn test_sequence_length() {
        let t = TableRef::from_list(vec![Value::from(10), Value::from(20), Value::from(30)]);
        assert_eq!(t.len(), 3);
        t.set(Value::from(2), Value::Nil);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_sequence_border_tracks_holes() {
        let t = TableRef::from_list((1..=100_000).map(Value::from));
        assert_eq!(t.len(), 100_000);

        t.set(50_000, Value::Nil);
        assert_eq!(t.len(), 49_999);
        assert_eq!(t.get(&Value::from(50_001)), Value::from(50_001));

        t.set(50_000, "back");
        assert_eq!(t.len(), 100_000);

        // a key past the border does not extend it until the gap fills
        t.set(100_002, true);
        assert_eq!(t.len(), 100_000);
        t.push(0);
        assert_eq!(t.len(), 100_002);
    }

    #[test]
    fn test_number_keys_follow_raw_equality() {
        let t = TableRef::new();
        t.set(0.0, "zero");
        assert_eq!(t.get(&Value::Number(-0.0)), Value::str("zero"));

        t.set(f64::NAN, "nan");
        assert!(t.get(&Value::Number(f64::NAN)).is_nil());
        assert_eq!(t.pairs().len(), 1);
    }

    #[test]
    fn test_removal_keeps_order_and_lookup() {
        let t = TableRef::new();
        for k in ["a", "b", "c", "d"] {
            t.set(k, k);
        }
        t.set("b", Value::Nil);
        let keys: Vec<Value> = t.pairs().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Value::str("a"), Value::str("c"), Value::str("d")]);
        assert_eq!(t.get_str("d"), Value::str("d"));
        assert_eq!(t.get_str("c"), Value::str("c"));
    }

    #[test]
    fn test_deep_eq_handles_cycles() {
        let a = TableRef::new();
        a.set("self", a.clone());
        let b = TableRef::new();
        b.set("self", b.clone());
        assert_eq!(Value::Table(a), Value::Table(b));
    }

    #[test]
    fn test_upvalues_numbered_from_one() {
        let f = FunctionRef::closure(vec![1, 2, 3], vec![Value::from(1)]);
        assert_eq!(f.upvalue(1), Value::from(1));
        assert!(f.upvalue(0).is_nil());

        f.set_upvalue(3, Value::str("x"));
        assert_eq!(f.upvalue_count(), 3);
        assert!(f.upvalue(2).is_nil());
        assert_eq!(f.upvalue(3), Value::str("x"));
    }

    #[test]
    fn test_native_function() {
        fn count(args: &[Value]) -> Vec<Value> {
            vec![Value::Number(args.len() as f64)]
        }
        let f = FunctionRef::native("count", count);
        let native = f.as_native().unwrap();
        assert_eq!(native.name(), "count");
        assert_eq!(native.call(&[Value::Nil, Value::Nil]), vec![Value::from(2)]);
        assert_eq!(f.upvalue_count(), 0);
    }
}
