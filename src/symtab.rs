//! Symbol table: lexically scoped variable contexts plus the program-wide
//! function and record-type tables.
//!
//! Variable offsets are stored the way the stack grows: a positive offset
//! `k` names the slot at `%ebp - k`, and parameters carry negative offsets
//! (`-8`, `-12`, ...) so the same address computation reaches above the
//! saved frame pointer.

use std::collections::HashMap;

use crate::ast::{is_int_type, FunctionDef, TypeDef};
use crate::error::CodeGenError;

type Result<T> = std::result::Result<T, CodeGenError>;

/// Prefix for compiler-generated temporary slots.
pub const TMP_PREFIX: &str = "tmp_";

/// First local slot: the two info words occupy `%ebp - 4` and `%ebp - 8`.
pub const FIRST_LOCAL_OFFSET: i32 = 12;

/// First parameter slot: `%ebp + 8`, just above the return address.
pub const FIRST_PARAM_OFFSET: i32 = -8;

/// Highest field index a header word can mark as a reference (bits 1..23).
pub const MAX_REF_FIELD_INDEX: usize = 22;

/// Highest field count a header word can carry (the high byte).
pub const MAX_FIELD_COUNT: usize = 255;

/// Stack slot and declared type of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    pub offset: i32,
    pub type_name: String,
}

/// Signature of a defined function, used for arity checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnInfo {
    pub param_types: Vec<String>,
    pub return_type: String,
}

/// Layout of a record type: ordered fields as (name, type) pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: String,
    pub fields: Vec<(String, String)>,
}

impl TypeInfo {
    /// Index and type of a field, or `None` if the type has no such field.
    pub fn field(&self, field: &str) -> Option<(i32, &str)> {
        self.fields
            .iter()
            .position(|(name, _)| name == field)
            .map(|i| (i as i32, self.fields[i].1.as_str()))
    }

    /// The header word for values of this type: field count in the high
    /// byte, the reference bitmap in bits 1..23 (bit `i + 1` marks field
    /// `i`), and the live bit set.
    pub fn tag(&self) -> u32 {
        let mut tag = (self.fields.len() as u32) << 24;
        for (i, (_, type_name)) in self.fields.iter().enumerate() {
            if !is_int_type(type_name) {
                tag |= 1 << (i + 1);
            }
        }
        tag | 1
    }

    /// Can `tag` describe this layout to the collector? Reference fields
    /// past the bitmap, or counts past the high byte, cannot be encoded.
    pub fn is_traceable(&self) -> bool {
        self.fields.len() <= MAX_FIELD_COUNT
            && self
                .fields
                .iter()
                .enumerate()
                .all(|(i, (_, ty))| is_int_type(ty) || i <= MAX_REF_FIELD_INDEX)
    }
}

/// A nested variable context with lexical scoping.
#[derive(Debug)]
struct Context {
    vars: HashMap<String, VarInfo>,
    parent: Option<Box<Context>>,
    next_offset: i32,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            vars: HashMap::new(),
            parent: None,
            next_offset: FIRST_LOCAL_OFFSET,
        }
    }
}

impl Context {
    fn lookup(&self, name: &str) -> Option<&VarInfo> {
        match self.vars.get(name) {
            Some(info) => Some(info),
            None => self.parent.as_ref()?.lookup(name),
        }
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    types: HashMap<String, TypeInfo>,
    functions: HashMap<String, FnInfo>,
    ctx: Context,
    next_tmp: u32,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Record a type definition; duplicate names and layouts the collector
    /// cannot trace are rejected.
    pub fn add_type_def(&mut self, def: &TypeDef) -> Result<()> {
        if self.types.contains_key(&def.name) {
            return Err(CodeGenError::DuplicateType {
                name: def.name.clone(),
            });
        }
        let info = TypeInfo {
            name: def.name.clone(),
            fields: def
                .fields
                .iter()
                .map(|field| (field.name.clone(), field.type_name.clone()))
                .collect(),
        };
        if !info.is_traceable() {
            return Err(CodeGenError::UntraceableLayout {
                name: def.name.clone(),
            });
        }
        self.types.insert(def.name.clone(), info);
        Ok(())
    }

    /// Record a function signature; duplicate names are rejected.
    pub fn add_fn_def(&mut self, def: &FunctionDef) -> Result<()> {
        if self.functions.contains_key(&def.name) {
            return Err(CodeGenError::DuplicateFunction {
                name: def.name.clone(),
            });
        }
        self.functions.insert(
            def.name.clone(),
            FnInfo {
                param_types: def.params.iter().map(|p| p.type_name.clone()).collect(),
                return_type: def.return_type.clone(),
            },
        );
        Ok(())
    }

    pub fn type_info(&self, name: &str) -> Option<&TypeInfo> {
        self.types.get(name)
    }

    pub fn arity_of(&self, name: &str) -> Result<usize> {
        match self.functions.get(name) {
            Some(info) => Ok(info.param_types.len()),
            None => Err(CodeGenError::UndefinedFunction {
                name: name.to_string(),
            }),
        }
    }

    /// Drop all local contexts; used when entering a function definition.
    pub fn reset_locals(&mut self) {
        self.ctx = Context::default();
    }

    /// Enter a nested scope. The offset counter carries over so new slots
    /// land below everything already allocated.
    pub fn open_scope(&mut self) {
        let next_offset = self.ctx.next_offset;
        let parent = std::mem::take(&mut self.ctx);
        self.ctx = Context {
            vars: HashMap::new(),
            parent: Some(Box::new(parent)),
            next_offset,
        };
    }

    /// Leave the current scope, discarding its variables.
    pub fn close_scope(&mut self) {
        let parent = self
            .ctx
            .parent
            .take()
            .expect("close_scope without a matching open_scope");
        self.ctx = *parent;
    }

    /// Allocate a stack slot for a variable in the current scope and
    /// return its offset.
    pub fn allocate_var(&mut self, name: &str, type_name: &str) -> Result<i32> {
        if self.ctx.vars.contains_key(name) {
            return Err(CodeGenError::DuplicateVariable {
                name: name.to_string(),
            });
        }
        let offset = self.ctx.next_offset;
        self.ctx.vars.insert(
            name.to_string(),
            VarInfo {
                offset,
                type_name: type_name.to_string(),
            },
        );
        self.ctx.next_offset += 4;
        Ok(offset)
    }

    /// Record a parameter at its caller-assigned offset.
    pub fn add_param(&mut self, name: &str, type_name: &str, offset: i32) -> Result<()> {
        if self.ctx.vars.contains_key(name) {
            return Err(CodeGenError::DuplicateVariable {
                name: name.to_string(),
            });
        }
        self.ctx.vars.insert(
            name.to_string(),
            VarInfo {
                offset,
                type_name: type_name.to_string(),
            },
        );
        Ok(())
    }

    /// Walk the scope chain outward for a variable.
    pub fn lookup(&self, name: &str) -> Option<&VarInfo> {
        self.ctx.lookup(name)
    }

    /// Fresh name for a temporary slot; the counter never resets within a
    /// program so every temporary name is unique.
    pub fn fresh_tmp_name(&mut self) -> String {
        let name = format!("{}{}", TMP_PREFIX, self.next_tmp);
        self.next_tmp += 1;
        name
    }

    /// Track words pushed onto (positive) or popped from (negative) the
    /// stack outside of slot allocation, so temporaries created while
    /// arguments sit on the stack land below them.
    pub fn adjust_stack(&mut self, bytes: i32) {
        self.ctx.next_offset += bytes;
    }
}
