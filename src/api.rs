//! The embedder surface.
//!
//! Everything is register-indexed: values move between the embedder and the
//! runtime through the registers of the current frame (enter one with
//! [`Context::native_block`]).  Shallow misuse — bad register index, wrong
//! type at a scalar read, malformed format string — comes back as a
//! non-throwing [`ApiError`]; script-level failures surface as
//! [`ApiError::Exc`] with the exception object in REG-0; unrecoverable
//! conditions unwind with a [`RuntimePanic`] payload that [`catch_panic`]
//! recovers.

use crate::context::{Context, ExecResult, PanicCode, RuntimePanic, Thrown};
use crate::interp::invoke::{self, ArgSource};
use crate::object::func_obj::{FuncMeta, NativeFn};
use crate::object::type_obj::{SizeSpec, TypeObj};
use crate::object::value::Value;
use crate::object::{
    array_obj, bool_obj, exception_obj, float_obj, func_obj, int_obj, map_obj, module_obj,
    string_obj, symbol_obj, tuple_obj,
};

/// Status of a failed embedder-API call.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ApiError {
    /// An exception was thrown; the exception object is in REG-0.
    Exc,
    /// Invalid argument.
    Arg,
    /// Register or element index out of range.
    Idx,
    /// Wrong type at a scalar read/write site.
    Type,
    /// Buffer or numeric range too small for the value.
    Buf,
}

impl ApiError {
    /// The numeric status code crossing the boundary (`OK` is 0).
    pub fn code(self) -> i32 {
        match self {
            ApiError::Exc => -1,
            ApiError::Arg => -11,
            ApiError::Idx => -12,
            ApiError::Type => -13,
            ApiError::Buf => -14,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// One value crossing the boundary in [`Context::make_values`] /
/// [`Context::read_values`].
#[derive(Clone, Debug, PartialEq)]
pub enum ApiValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(String),
    Bytes(Vec<u8>),
    /// A register reference (`%` specifier).
    Reg(usize),
    Tuple(Vec<ApiValue>),
    Array(Vec<ApiValue>),
    Map(Vec<(ApiValue, ApiValue)>),
}

/// Layout and fields of a type built through [`Context::make_type`].
pub struct TypeDef<'a> {
    pub slots: SizeSpec,
    pub bytes: SizeSpec,
    /// Field names, mapped in order to slot indices `0..`.
    pub fields: &'a [&'a str],
}

/// Code and arity of a function built through [`Context::make_function`].
pub struct FunctionDef<'a> {
    pub meta: FuncMeta,
    pub code: FuncCode<'a>,
}

pub enum FuncCode<'a> {
    Native(NativeFn),
    Bytecode(&'a [u32]),
}

/// Information about an exception object, for embedder inspection.
#[derive(Clone, Debug)]
pub struct ExceptionInfo {
    /// Name of the kind symbol (`type`, `key`, `sys`, ...).
    pub kind: String,
    /// The human-readable message, if it is a string.
    pub what: Option<String>,
    /// Number of `(function, offset)` stack-trace entries.
    pub trace_len: usize,
}

impl Context {
    fn reg_slot(&self, reg: usize) -> ApiResult<usize> {
        let slot = self.stack.frame() + reg;
        if slot > self.stack.top() {
            return Err(ApiError::Idx);
        }
        Ok(slot)
    }

    fn reg_value(&self, reg: usize) -> ApiResult<Value> {
        Ok(self.stack.get(self.reg_slot(reg)?))
    }

    fn set_reg_value(&mut self, reg: usize, v: Value) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        self.stack.set(slot, v);
        Ok(())
    }

    // ----- scalar construction and reading -------------------------------

    pub fn make_nil(&mut self, reg: usize) -> ApiResult<()> {
        let nil = self.globals.val_nil;
        self.set_reg_value(reg, nil)
    }

    pub fn read_nil(&self, reg: usize) -> ApiResult<()> {
        if self.reg_value(reg)? == self.globals.val_nil {
            Ok(())
        } else {
            Err(ApiError::Type)
        }
    }

    pub fn make_bool(&mut self, reg: usize, b: bool) -> ApiResult<()> {
        let v = bool_obj::make(self, b);
        self.set_reg_value(reg, v)
    }

    pub fn read_bool(&self, reg: usize) -> ApiResult<bool> {
        bool_obj::read(self, self.reg_value(reg)?).ok_or(ApiError::Type)
    }

    pub fn make_int(&mut self, reg: usize, v: i64) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        let val = int_obj::make(self, v as i128);
        self.stack.set(slot, val);
        Ok(())
    }

    pub fn read_int(&self, reg: usize) -> ApiResult<i64> {
        let v = self.reg_value(reg)?;
        let wide = int_obj::to_i128(self, v).ok_or(ApiError::Type)?;
        i64::try_from(wide).map_err(|_| ApiError::Buf)
    }

    pub fn make_float(&mut self, reg: usize, v: f64) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        let val = float_obj::new(self, v);
        self.stack.set(slot, val);
        Ok(())
    }

    pub fn read_float(&self, reg: usize) -> ApiResult<f64> {
        let v = self.reg_value(reg)?;
        if v.type_is(self.globals.type_float) {
            Ok(float_obj::get(v))
        } else {
            Err(ApiError::Type)
        }
    }

    pub fn make_string(&mut self, reg: usize, s: &str) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        let val = string_obj::new(self, s);
        self.stack.set(slot, val);
        Ok(())
    }

    pub fn read_string(&self, reg: usize) -> ApiResult<String> {
        let v = self.reg_value(reg)?;
        if v.type_is(self.globals.type_string) {
            // Byte-strings share the representation but may not be UTF-8.
            std::str::from_utf8(string_obj::as_bytes(v))
                .map(str::to_string)
                .map_err(|_| ApiError::Type)
        } else {
            Err(ApiError::Type)
        }
    }

    /// Store a raw byte string (shares the `String` representation).
    pub fn make_bytes(&mut self, reg: usize, bytes: &[u8]) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        let val = string_obj::new_bytes(self, bytes);
        self.stack.set(slot, val);
        Ok(())
    }

    pub fn read_bytes(&self, reg: usize) -> ApiResult<Vec<u8>> {
        let v = self.reg_value(reg)?;
        if v.type_is(self.globals.type_string) {
            Ok(string_obj::as_bytes(v).to_vec())
        } else {
            Err(ApiError::Type)
        }
    }

    /// Byte length of a string register, without copying.
    pub fn read_string_len(&self, reg: usize) -> ApiResult<usize> {
        let v = self.reg_value(reg)?;
        if v.type_is(self.globals.type_string) {
            Ok(string_obj::byte_len(v))
        } else {
            Err(ApiError::Type)
        }
    }

    pub fn make_symbol(&mut self, reg: usize, s: &str) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        let val = crate::symbols::intern(self, s);
        self.stack.set(slot, val);
        Ok(())
    }

    pub fn read_symbol(&self, reg: usize) -> ApiResult<String> {
        let v = self.reg_value(reg)?;
        if v.type_is(self.globals.type_symbol) {
            Ok(symbol_obj::as_str(v).to_string())
        } else {
            Err(ApiError::Type)
        }
    }

    // ----- the format mini-language ---------------------------------------

    /// Construct values into consecutive registers from `reg` according to
    /// `fmt`, drawing payloads from `args`.  Specifiers: `%` (copy from the
    /// register named by a `Reg` argument), `n` nil, `x` bool, `i` int,
    /// `f` float, `s` string, `y` symbol, `(...)`/`[...]`/`{...}` tuple,
    /// array, map (single-level nesting; `{}` pairs key and value specs),
    /// `-` skip a register, `?` permit nil for the next specifier, `*`
    /// repeat a collection's single inner specifier by an `Int` count
    /// argument.  Returns the number of registers written or skipped.
    pub fn make_values(&mut self, reg: usize, fmt: &str, args: &[ApiValue]) -> ApiResult<usize> {
        let specs = parse_specs(fmt)?;
        let mut args = args.iter();
        let mut offset = 0;
        for spec in &specs {
            if matches!(spec, Spec::Skip) {
                offset += 1;
                continue;
            }
            let v = self.build_value(spec, &mut args)?;
            self.set_reg_value(reg + offset, v)?;
            offset += 1;
        }
        Ok(offset)
    }

    fn build_value(
        &mut self,
        spec: &Spec,
        args: &mut std::slice::Iter<'_, ApiValue>,
    ) -> ApiResult<Value> {
        match spec {
            Spec::Skip => unreachable!("skip handled by the register loop"),
            Spec::Nil => Ok(self.globals.val_nil),
            Spec::Scalar(c) => {
                let arg = args.next().ok_or(ApiError::Arg)?;
                self.build_scalar(*c, arg)
            }
            Spec::Nilable(inner) => {
                // Peek: a Nil argument satisfies any nilable specifier.
                if matches!(args.clone().next(), Some(ApiValue::Nil)) {
                    args.next();
                    return Ok(self.globals.val_nil);
                }
                self.build_value(inner, args)
            }
            Spec::Collection { kind, inner, counted } => {
                let inner_specs: Vec<Spec> = if *counted {
                    let Some(ApiValue::Int(n)) = args.next() else {
                        return Err(ApiError::Arg);
                    };
                    if inner.len() != 1 {
                        return Err(ApiError::Arg);
                    }
                    std::iter::repeat(inner[0].clone())
                        .take(*n as usize)
                        .collect()
                } else {
                    inner.clone()
                };
                let n = inner_specs.len();
                let t = self.stack.alloc_temp(n.max(1));
                let mut failed = None;
                for (i, s) in inner_specs.iter().enumerate() {
                    match self.build_value(s, args) {
                        Ok(v) => self.stack.set(t + i, v),
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                if let Some(e) = failed {
                    self.stack.free_temp(n.max(1));
                    return Err(e);
                }
                let result = match kind {
                    CollectionKind::Tuple => Ok(tuple_obj::new_from_stack(self, t, n)),
                    CollectionKind::Array => Ok(array_obj::new_from_stack(self, t, n)),
                    CollectionKind::Map => {
                        if n % 2 != 0 {
                            Err(ApiError::Arg)
                        } else {
                            let m = map_obj::new(self, 0.0, n / 2);
                            let tm = self.stack.alloc_temp(1);
                            self.stack.set(tm, m);
                            let mut err = None;
                            for i in (0..n).step_by(2) {
                                if map_obj::set(self, tm, t + i, t + i + 1).is_err() {
                                    err = Some(ApiError::Exc);
                                    break;
                                }
                            }
                            let m = self.stack.get(tm);
                            self.stack.free_temp(1);
                            match err {
                                Some(e) => Err(e),
                                None => Ok(m),
                            }
                        }
                    }
                };
                self.stack.free_temp(n.max(1));
                result
            }
        }
    }

    fn build_scalar(&mut self, c: char, arg: &ApiValue) -> ApiResult<Value> {
        match (c, arg) {
            ('x', ApiValue::Bool(b)) => Ok(bool_obj::make(self, *b)),
            ('i', ApiValue::Int(i)) => Ok(int_obj::make(self, *i as i128)),
            ('f', ApiValue::Float(f)) => Ok(float_obj::new(self, *f)),
            ('s', ApiValue::Str(s)) => Ok(string_obj::new(self, s)),
            ('y', ApiValue::Sym(s)) => Ok(crate::symbols::intern(self, s)),
            ('%', ApiValue::Reg(r)) => self.reg_value(*r),
            _ => Err(ApiError::Arg),
        }
    }

    /// Read values from consecutive registers starting at `reg` according
    /// to `fmt`.  The inverse of [`Context::make_values`].
    pub fn read_values(&mut self, reg: usize, fmt: &str) -> ApiResult<Vec<ApiValue>> {
        let specs = parse_specs(fmt)?;
        let mut out = Vec::new();
        let mut offset = 0;
        for spec in &specs {
            if matches!(spec, Spec::Skip) {
                offset += 1;
                continue;
            }
            if let Spec::Scalar('%') = spec {
                out.push(ApiValue::Reg(reg + offset));
                offset += 1;
                continue;
            }
            let v = self.reg_value(reg + offset)?;
            out.push(self.read_one(spec, v)?);
            offset += 1;
        }
        Ok(out)
    }

    fn read_one(&self, spec: &Spec, v: Value) -> ApiResult<ApiValue> {
        let g = &self.globals;
        match spec {
            Spec::Skip => unreachable!(),
            Spec::Nil => {
                if v == g.val_nil {
                    Ok(ApiValue::Nil)
                } else {
                    Err(ApiError::Type)
                }
            }
            Spec::Nilable(inner) => {
                if v == g.val_nil {
                    Ok(ApiValue::Nil)
                } else {
                    self.read_one(inner, v)
                }
            }
            Spec::Scalar(c) => match c {
                'x' => bool_obj::read(self, v).map(ApiValue::Bool).ok_or(ApiError::Type),
                'i' => {
                    let wide = int_obj::to_i128(self, v).ok_or(ApiError::Type)?;
                    i64::try_from(wide).map(ApiValue::Int).map_err(|_| ApiError::Buf)
                }
                'f' => {
                    if v.type_is(g.type_float) {
                        Ok(ApiValue::Float(float_obj::get(v)))
                    } else {
                        Err(ApiError::Type)
                    }
                }
                's' => {
                    if v.type_is(g.type_string) {
                        Ok(ApiValue::Str(string_obj::as_str(v).to_string()))
                    } else {
                        Err(ApiError::Type)
                    }
                }
                'y' => {
                    if v.type_is(g.type_symbol) {
                        Ok(ApiValue::Sym(symbol_obj::as_str(v).to_string()))
                    } else {
                        Err(ApiError::Type)
                    }
                }
                _ => Err(ApiError::Arg),
            },
            Spec::Collection { kind, inner, counted } => match kind {
                CollectionKind::Tuple => {
                    if !v.type_is(g.type_tuple) {
                        return Err(ApiError::Type);
                    }
                    let len = tuple_obj::length(v);
                    let elems =
                        self.read_elements(inner, *counted, len, |i| tuple_obj::get(v, i))?;
                    Ok(ApiValue::Tuple(elems))
                }
                CollectionKind::Array => {
                    if !v.type_is(g.type_array) {
                        return Err(ApiError::Type);
                    }
                    let len = array_obj::length(v);
                    let elems = self.read_elements(inner, *counted, len, |i| {
                        array_obj::get(v, i).unwrap()
                    })?;
                    Ok(ApiValue::Array(elems))
                }
                CollectionKind::Map => {
                    if !v.type_is(g.type_map) {
                        return Err(ApiError::Type);
                    }
                    // One key spec, one value spec, applied to every entry.
                    if inner.len() != 2 {
                        return Err(ApiError::Arg);
                    }
                    let mut entries = Vec::with_capacity(map_obj::length(v));
                    let mut err = None;
                    map_obj::for_each_entry(v.as_obj(), |k, val| {
                        if err.is_some() {
                            return;
                        }
                        match (self.read_one(&inner[0], k), self.read_one(&inner[1], val)) {
                            (Ok(k), Ok(val)) => entries.push((k, val)),
                            _ => err = Some(ApiError::Type),
                        }
                    });
                    match err {
                        Some(e) => Err(e),
                        None => Ok(ApiValue::Map(entries)),
                    }
                }
            },
        }
    }

    fn read_elements(
        &self,
        inner: &[Spec],
        counted: bool,
        len: usize,
        get: impl Fn(usize) -> Value,
    ) -> ApiResult<Vec<ApiValue>> {
        if counted {
            if inner.len() != 1 {
                return Err(ApiError::Arg);
            }
            (0..len).map(|i| self.read_one(&inner[0], get(i))).collect()
        } else {
            if inner.len() != len {
                return Err(ApiError::Buf);
            }
            inner
                .iter()
                .enumerate()
                .map(|(i, s)| self.read_one(s, get(i)))
                .collect()
        }
    }

    // ----- variables and elements -----------------------------------------

    /// Copy a register.
    pub fn move_local(&mut self, dst: usize, src: usize) -> ApiResult<()> {
        let v = self.reg_value(src)?;
        self.set_reg_value(dst, v)
    }

    fn element_op(
        &mut self,
        name_sym: Value,
        args: &[Value],
        dst: Option<usize>,
    ) -> ApiResult<()> {
        // The invocation machinery uses REG-0 as the callable and result
        // register; unlike a raw `invoke`, the element operations restore it
        // so the embedder can keep the container there.  A thrown exception
        // stays in REG-0, per the status contract.
        let frame = self.stack.frame();
        let t = self.stack.alloc_temp(1);
        let reg0 = self.stack.get(frame);
        self.stack.set(t, reg0);
        match invoke::invoke_method_vals(self, name_sym, args) {
            Ok(result) => {
                let saved = self.stack.get(t);
                self.stack.free_temp(1);
                self.stack.set(frame, saved);
                if let Some(dst) = dst {
                    self.set_reg_value(dst, result)?;
                }
                Ok(())
            }
            Err(Thrown) => {
                self.stack.free_temp(1);
                Err(ApiError::Exc)
            }
        }
    }

    /// `dst = obj[key]`, dispatched to the object's `[]` method.
    pub fn get_element(&mut self, obj: usize, key: usize, dst: usize) -> ApiResult<()> {
        let args = [self.reg_value(obj)?, self.reg_value(key)?];
        let name = self.globals.sym_get_element;
        self.element_op(name, &args, Some(dst))
    }

    /// `obj[key] = val`, dispatched to the object's `[]=` method.
    pub fn set_element(&mut self, obj: usize, key: usize, val: usize) -> ApiResult<()> {
        let args = [self.reg_value(obj)?, self.reg_value(key)?, self.reg_value(val)?];
        let name = self.globals.sym_set_element;
        self.element_op(name, &args, None)
    }

    /// Dispatches to the object's `insert` method.
    pub fn insert_element(&mut self, obj: usize, key: usize, val: usize) -> ApiResult<()> {
        let args = [self.reg_value(obj)?, self.reg_value(key)?, self.reg_value(val)?];
        let name = self.globals.sym_insert;
        self.element_op(name, &args, None)
    }

    /// Dispatches to the object's `remove` method.
    pub fn remove_element(&mut self, obj: usize, key: usize) -> ApiResult<()> {
        let args = [self.reg_value(obj)?, self.reg_value(key)?];
        let name = self.globals.sym_remove;
        self.element_op(name, &args, None)
    }

    /// Read a named global from the entry module.
    pub fn get_global(&mut self, name: &str, dst: usize) -> ApiResult<()> {
        let _ = self.reg_slot(dst)?;
        let sym = crate::symbols::intern(self, name);
        let module = self.globals.entry_module.as_obj();
        match module_obj::get(module, sym) {
            Some(v) => self.set_reg_value(dst, v),
            None => Err(ApiError::Arg),
        }
    }

    /// Define or update a named global in the entry module.
    pub fn set_global(&mut self, name: &str, src: usize) -> ApiResult<()> {
        let src_slot = self.reg_slot(src)?;
        let t = self.stack.alloc_temp(2);
        let module = self.globals.entry_module;
        self.stack.set(t, module);
        let sym = crate::symbols::intern(self, name);
        self.stack.set(t + 1, sym);
        let result = module_obj::set(self, t, t + 1, src_slot);
        self.stack.free_temp(2);
        result.map(|_| ()).map_err(|Thrown| ApiError::Exc)
    }

    // ----- callables ------------------------------------------------------

    /// Build a function into `reg`.  For bytecode functions, `symbols`
    /// populates the symbol table (interned in order), `constants_reg`
    /// optionally names a register holding the constant tuple, and
    /// `module_reg` optionally names a register holding the owning module
    /// (default: the entry module).
    pub fn make_function(
        &mut self,
        reg: usize,
        def: &FunctionDef,
        symbols: &[&str],
        constants_reg: Option<usize>,
        module_reg: Option<usize>,
    ) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        if !def.meta.is_valid() {
            return Err(ApiError::Arg);
        }
        match def.code {
            FuncCode::Native(f) => {
                let v = func_obj::new_native(self, def.meta, f);
                self.stack.set(slot, v);
                Ok(())
            }
            FuncCode::Bytecode(code) => {
                let constants = match constants_reg {
                    Some(r) => {
                        let v = self.reg_value(r)?;
                        if !v.type_is(self.globals.type_tuple) {
                            return Err(ApiError::Type);
                        }
                        v
                    }
                    None => self.globals.val_empty_tuple,
                };
                let module = match module_reg {
                    Some(r) => {
                        let v = self.reg_value(r)?;
                        if !v.type_is(self.globals.type_module) {
                            return Err(ApiError::Type);
                        }
                        v
                    }
                    None => self.globals.entry_module,
                };

                let t = self.stack.alloc_temp(3);
                self.stack.set(t + 1, constants);
                self.stack.set(t + 2, module);
                let sym_tuple = tuple_obj::new_uninit(self, symbols.len());
                self.stack.set(t, sym_tuple);
                for (i, name) in symbols.iter().enumerate() {
                    let sym = crate::symbols::intern(self, name);
                    tuple_obj::set_uninit(self.stack.get(t), i, sym);
                }
                let v = func_obj::new_bytecode(self, def.meta, code, t, t + 1, t + 2);
                self.stack.free_temp(3);
                self.stack.set(slot, v);
                Ok(())
            }
        }
    }

    /// Build a type descriptor into `reg`.
    pub fn make_type(&mut self, reg: usize, def: &TypeDef) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        if let SizeSpec::Fixed(n) = def.slots {
            if def.fields.len() > n {
                return Err(ApiError::Arg);
            }
        }
        let ty_v = crate::globals::new_type_for_api(self, def.slots, def.bytes);
        self.stack.set(slot, ty_v);

        // Field map and an (initially empty) method table.
        let t = self.stack.alloc_temp(3);
        self.stack.set(t, ty_v);
        let fields = map_obj::new(self, 0.0, def.fields.len().max(1));
        {
            let ty_v = self.stack.get(t);
            let ty = unsafe { TypeObj::deref(ty_v.as_obj()) };
            ty.set_fields_map(ty_v.as_obj(), fields);
        }
        for (index, name) in def.fields.iter().enumerate() {
            let sym = crate::symbols::intern(self, name);
            self.stack.set(t + 1, sym);
            self.stack.set(t + 2, Value::smallint(index as isize));
            let ty_v = self.stack.get(t);
            let map = unsafe { TypeObj::deref(ty_v.as_obj()) }.fields_map();
            let tm = self.stack.alloc_temp(1);
            self.stack.set(tm, map);
            let r = map_obj::set(self, tm, t + 1, t + 2);
            self.stack.free_temp(1);
            if r.is_err() {
                self.stack.free_temp(3);
                return Err(ApiError::Exc);
            }
        }
        let methods = map_obj::new(self, 0.0, 4);
        {
            let ty_v = self.stack.get(t);
            let ty = unsafe { TypeObj::deref(ty_v.as_obj()) };
            ty.set_methods_map(ty_v.as_obj(), methods);
        }
        let ty_v = self.stack.get(t);
        self.stack.free_temp(3);
        self.stack.set(slot, ty_v);
        Ok(())
    }

    /// Instantiate the (fully fixed-layout) type in `type_reg`; all slots
    /// start as nil.
    pub fn make_instance(&mut self, reg: usize, type_reg: usize) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        let ty_v = self.reg_value(type_reg)?;
        if !ty_v.type_is(self.globals.type_type) {
            return Err(ApiError::Type);
        }
        {
            let ty = unsafe { TypeObj::deref(ty_v.as_obj()) };
            if ty.slots_spec().is_extendable() || ty.bytes_spec().is_extendable() {
                return Err(ApiError::Arg);
            }
        }
        let obj = self.mem.alloc(ty_v.as_obj());
        // Slots must never be left as raw garbage: a collection could walk
        // them before the embedder stores anything.
        let nil = self.globals.val_nil;
        for i in 0..obj.slot_count() {
            obj.set_slot_no_barrier(i, nil);
        }
        crate::mem::objmem::write_barrier_n(obj, 0, obj.slot_count());
        self.stack.set(slot, Value::from_obj(obj));
        Ok(())
    }

    /// Add a method (`func_reg`) under `name` to the type in `type_reg`.
    pub fn type_add_method(&mut self, type_reg: usize, name: &str, func_reg: usize) -> ApiResult<()> {
        let ty_v = self.reg_value(type_reg)?;
        if !ty_v.type_is(self.globals.type_type) {
            return Err(ApiError::Type);
        }
        let func_slot = self.reg_slot(func_reg)?;
        let t = self.stack.alloc_temp(2);
        let map = unsafe { TypeObj::deref(ty_v.as_obj()) }.methods_map();
        if map.is_smallint() {
            self.stack.free_temp(2);
            return Err(ApiError::Arg);
        }
        self.stack.set(t, map);
        let sym = crate::symbols::intern(self, name);
        self.stack.set(t + 1, sym);
        let r = map_obj::set(self, t, t + 1, func_slot);
        self.stack.free_temp(2);
        r.map_err(|Thrown| ApiError::Exc)
    }

    /// Build an empty module into `reg`.
    pub fn make_module(&mut self, reg: usize) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        let v = module_obj::new(self);
        self.stack.set(slot, v);
        Ok(())
    }

    /// Define or update a named global of the module in `module_reg`.
    pub fn module_set_global(
        &mut self,
        module_reg: usize,
        name: &str,
        src: usize,
    ) -> ApiResult<()> {
        let module = self.reg_value(module_reg)?;
        if !module.type_is(self.globals.type_module) {
            return Err(ApiError::Type);
        }
        let src_slot = self.reg_slot(src)?;
        let t = self.stack.alloc_temp(2);
        self.stack.set(t, module);
        let sym = crate::symbols::intern(self, name);
        self.stack.set(t + 1, sym);
        let result = module_obj::set(self, t, t + 1, src_slot);
        self.stack.free_temp(2);
        result.map(|_| ()).map_err(|Thrown| ApiError::Exc)
    }

    /// Register the module in `module_reg` with the loader under a
    /// top-level name (resolvable by the `IMP` instruction).
    pub fn register_module(&mut self, name: &str, module_reg: usize) -> ApiResult<()> {
        let module = self.reg_value(module_reg)?;
        if !module.type_is(self.globals.type_module) {
            return Err(ApiError::Type);
        }
        self.loader.register(name, module);
        Ok(())
    }

    /// Invoke a callable.  `regs[0]` is the return destination, `regs[1]`
    /// the callable, `regs[2..]` the arguments.  On `Err(Exc)`, the
    /// exception object is in REG-0 (and in the return destination).
    pub fn invoke(&mut self, regs: &[usize]) -> ApiResult<()> {
        if regs.len() < 2 {
            return Err(ApiError::Arg);
        }
        let ret_slot = self.reg_slot(regs[0])?;
        let callable = self.reg_value(regs[1])?;
        let argc = regs.len() - 2;

        // Capture the arguments before REG-0 is repurposed as the callable
        // slot: temporaries keep them rooted across the call.
        let t = self.stack.alloc_temp(argc.max(1));
        for (i, &r) in regs[2..].iter().enumerate() {
            let v = match self.reg_value(r) {
                Ok(v) => v,
                Err(e) => {
                    self.stack.free_temp(argc.max(1));
                    return Err(e);
                }
            };
            self.stack.set(t + i, v);
        }
        let frame = self.stack.frame();
        self.stack.set(frame, callable);

        let result = self.run_invocation(ret_slot, ArgSource::StackVec { base: t }, argc);
        self.stack.free_temp(argc.max(1));
        result
    }

    /// Invoke with packed arguments: `packed_reg` holds a tuple or an array
    /// whose elements become the arguments.
    pub fn invoke_packed(
        &mut self,
        ret: usize,
        callable: usize,
        packed_reg: usize,
    ) -> ApiResult<()> {
        let ret_slot = self.reg_slot(ret)?;
        let callable_v = self.reg_value(callable)?;
        let packed = self.reg_value(packed_reg)?;
        let (packed, argc) = if packed.type_is(self.globals.type_tuple) {
            (packed, tuple_obj::length(packed))
        } else if packed.type_is(self.globals.type_array) {
            (array_obj::backing(packed), array_obj::length(packed))
        } else {
            return Err(ApiError::Type);
        };

        let t = self.stack.alloc_temp(1);
        self.stack.set(t, packed);
        let frame = self.stack.frame();
        self.stack.set(frame, callable_v);
        let result = self.run_invocation(ret_slot, ArgSource::Packed { holder: t }, argc);
        self.stack.free_temp(1);
        result
    }

    fn run_invocation(
        &mut self,
        ret_slot: usize,
        src: ArgSource,
        argc: usize,
    ) -> ApiResult<()> {
        let entered = self.stack.frames_depth();
        let outcome = invoke::invocation_enter(self, None, ret_slot)
            .and_then(|ii| invoke::pass_args(self, src, argc, &ii))
            .and_then(|()| invoke::run_entered(self));
        match outcome {
            Ok(()) => Ok(()),
            Err(Thrown) => {
                if self.stack.frames_depth() > entered {
                    invoke::unwind(self, 0, 0);
                }
                // The exception propagated into the return destination;
                // surface it in REG-0 as well, per the status contract.
                let exc = self.stack.get(ret_slot);
                let frame = self.stack.frame();
                self.stack.set(frame, exc);
                Err(ApiError::Exc)
            }
        }
    }

    /// Enter a scratch frame of `max_reg + 1` registers, forward REG-0 into
    /// it, run `f`, and forward the block's REG-0 back out to the caller's
    /// REG-0.
    pub fn native_block(
        &mut self,
        max_reg: usize,
        f: impl FnOnce(&mut Context) -> ExecResult,
    ) -> ApiResult<()> {
        let caller_frame = self.stack.frame();
        let reg0 = self.stack.get(caller_frame);
        self.stack.enter(max_reg + 1, None, caller_frame);
        self.stack.set_reg(0, reg0);
        match f(self) {
            Ok(()) => {
                let out = self.stack.reg(0);
                let ip = self.stack.leave(out);
                debug_assert_eq!(ip, None);
                Ok(())
            }
            Err(Thrown) => {
                invoke::unwind(self, 0, 0);
                Err(ApiError::Exc)
            }
        }
    }

    /// Build an exception object into `reg` (primarily for native functions
    /// that want to throw: store it in REG-0 and return `Err(Thrown)`).
    pub fn make_exception(&mut self, reg: usize, kind: &str, msg: &str) -> ApiResult<()> {
        let slot = self.reg_slot(reg)?;
        let nil = self.globals.val_nil;
        let Thrown = exception_obj::throw_format(self, kind, nil, msg.to_string());
        // `throw_format` leaves the object in REG-0; move it where asked.
        let exc = self.stack.reg(0);
        self.stack.set(slot, exc);
        Ok(())
    }

    /// Abort execution: raises the unrecoverable `Abort` panic.
    pub fn abort(&self) -> ! {
        crate::context::raise_panic(PanicCode::Abort)
    }

    // ----- inspection -----------------------------------------------------

    /// Are two registers the very same value word (pointer identity or
    /// equal small ints)?
    pub fn values_identical(&self, a: usize, b: usize) -> ApiResult<bool> {
        Ok(self.reg_value(a)? == self.reg_value(b)?)
    }

    /// Are two registers equal under the object protocol?
    pub fn values_equal(&mut self, a: usize, b: usize) -> ApiResult<bool> {
        let va = self.reg_value(a)?;
        let vb = self.reg_value(b)?;
        Ok(crate::object::protocol::equals(self, va, vb))
    }

    /// Inspect the exception object in `reg`.
    pub fn read_exception(&self, reg: usize) -> ApiResult<ExceptionInfo> {
        let v = self.reg_value(reg)?;
        if !v.type_is(self.globals.type_exception) {
            return Err(ApiError::Type);
        }
        let kind_sym = exception_obj::kind(v);
        let kind = if kind_sym.type_is(self.globals.type_symbol) {
            symbol_obj::as_str(kind_sym).to_string()
        } else {
            String::new()
        };
        let what_v = exception_obj::what(v);
        let what = if what_v.type_is(self.globals.type_string) {
            Some(string_obj::as_str(what_v).to_string())
        } else {
            None
        };
        Ok(ExceptionInfo {
            kind,
            what,
            trace_len: exception_obj::stack_trace_len(v),
        })
    }

    /// Copy out the bytecode of the function in `reg` (the disassembly
    /// interface; see [`crate::interp::instr::format_instr`]).
    pub fn read_function_bytecode(&self, reg: usize) -> ApiResult<Vec<u32>> {
        let v = self.reg_value(reg)?;
        if !v.type_is(self.globals.type_function) {
            return Err(ApiError::Type);
        }
        Ok(func_obj::bytecode_to_vec(v.as_obj()))
    }

    /// GC state of the object in `reg`; `None` for small integers.
    pub fn reg_gc_state(&self, reg: usize) -> ApiResult<Option<crate::object::GcState>> {
        let v = self.reg_value(reg)?;
        Ok(if v.is_smallint() {
            None
        } else {
            Some(v.as_obj().gc_state())
        })
    }
}

// ----- format parsing ----------------------------------------------------

#[derive(Clone, Debug)]
enum Spec {
    Scalar(char),
    Nil,
    Skip,
    Nilable(Box<Spec>),
    Collection {
        kind: CollectionKind,
        inner: Vec<Spec>,
        counted: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum CollectionKind {
    Tuple,
    Array,
    Map,
}

fn parse_specs(fmt: &str) -> ApiResult<Vec<Spec>> {
    let mut chars = fmt.chars().peekable();
    let specs = parse_seq(&mut chars, None, true)?;
    if chars.next().is_some() {
        return Err(ApiError::Arg);
    }
    Ok(specs)
}

fn parse_seq(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    close: Option<char>,
    top_level: bool,
) -> ApiResult<Vec<Spec>> {
    let mut out = Vec::new();
    loop {
        let Some(&c) = chars.peek() else {
            return if close.is_none() { Ok(out) } else { Err(ApiError::Arg) };
        };
        if Some(c) == close {
            chars.next();
            return Ok(out);
        }
        chars.next();
        let spec = match c {
            'n' => Spec::Nil,
            'x' | 'i' | 'f' | 's' | 'y' | '%' => Spec::Scalar(c),
            '-' if top_level => Spec::Skip,
            '?' => {
                let rest = parse_one(chars, top_level)?;
                Spec::Nilable(Box::new(rest))
            }
            '*' => {
                let inner = parse_one(chars, false)?;
                match inner {
                    Spec::Collection { kind, inner, .. } => Spec::Collection {
                        kind,
                        inner,
                        counted: true,
                    },
                    _ => return Err(ApiError::Arg),
                }
            }
            '(' if top_level => collection(chars, CollectionKind::Tuple, ')')?,
            '[' if top_level => collection(chars, CollectionKind::Array, ']')?,
            '{' if top_level => collection(chars, CollectionKind::Map, '}')?,
            _ => return Err(ApiError::Arg),
        };
        out.push(spec);
    }
}

fn parse_one(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    top_level: bool,
) -> ApiResult<Spec> {
    let Some(c) = chars.next() else {
        return Err(ApiError::Arg);
    };
    match c {
        'n' => Ok(Spec::Nil),
        'x' | 'i' | 'f' | 's' | 'y' | '%' => Ok(Spec::Scalar(c)),
        '(' => collection(chars, CollectionKind::Tuple, ')'),
        '[' => collection(chars, CollectionKind::Array, ']'),
        '{' => collection(chars, CollectionKind::Map, '}'),
        '?' => Ok(Spec::Nilable(Box::new(parse_one(chars, top_level)?))),
        _ => Err(ApiError::Arg),
    }
}

fn collection(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    kind: CollectionKind,
    close: char,
) -> ApiResult<Spec> {
    // Nested collections are single-level only.
    let inner = parse_seq(chars, Some(close), false)?;
    Ok(Spec::Collection {
        kind,
        inner,
        counted: false,
    })
}

/// Run `f`, converting a [`RuntimePanic`] unwind into its [`PanicCode`].
/// Other panics are propagated.
pub fn catch_panic<T>(f: impl FnOnce() -> T + std::panic::UnwindSafe) -> Result<T, PanicCode> {
    match std::panic::catch_unwind(f) {
        Ok(v) => Ok(v),
        Err(payload) => match payload.downcast::<RuntimePanic>() {
            Ok(p) => Err(p.code),
            Err(other) => std::panic::resume_unwind(other),
        },
    }
}
