//! Interface fingerprints.
//!
//! The wire names an interface by a 64-bit fingerprint of its canonical
//! declaration, so that two independently built zones agree on what
//! "the same interface" means without exchanging schemas. The canonical
//! form concatenates the enclosing namespaces, a kind tag, the resolved
//! base types, and the ordered method or field list with attributes and
//! parameter types; any referenced declaration is substituted by its own
//! fingerprint first. The result is hashed with SHA3-256 and truncated
//! to the first eight bytes, interpreted little-endian.
//!
//! A type that is currently being hashed contributes zero when it is
//! reached again, which keeps mutually recursive declarations stable.
//!
//! Two legacy flags survive from historic builds that accidentally let
//! an attribute or an empty template argument list leak into the hash.
//! They are honoured bit for bit so that old ordinals keep resolving;
//! new declarations must leave both unset.

use crate::ids::InterfaceOrdinal;

use std::collections::HashMap;

use sha3::{Digest, Sha3_256};

/// Attribute that never participates in a fingerprint, so a method can
/// be flagged for removal without changing the interface's identity.
const DEPRECATED_FUNCTION: &str = "deprecated_function";

/// Attribute that leaked into historic fingerprints, see
/// [`LegacyFlags::keep_deprecated_contamination`].
const DEPRECATED: &str = "deprecated";

/// Backward-compatibility switches, set per declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyFlags {
    /// Historic builds hashed the `deprecated` attribute by accident.
    /// Declarations fingerprinted before the fix keep the contamination.
    pub keep_deprecated_contamination: bool,
    /// Historic builds mixed an empty template argument list into the
    /// hash. Declarations fingerprinted before the fix keep doing so.
    pub hash_empty_template_args: bool,
}

/// What a declaration is. The discriminator participates in the
/// canonical form for kinds that share a name space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Namespace,
    Struct,
    Interface,
    Library,
    Enum,
    Sequence,
    Typedef,
    FunctionMethod,
    FunctionVariable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub attributes: Vec<Attribute>,
    /// Referenced type, substituted by its fingerprint when registered.
    pub type_name: String,
    /// Reference modifiers in declaration order, for example `&` or `*`.
    pub modifiers: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub attributes: Vec<Attribute>,
    pub name: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub type_name: String,
    pub modifiers: String,
    pub name: String,
    /// Fixed array extent, empty when the field is scalar.
    pub array: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParameter {
    pub kind: String,
    pub name: String,
}

/// One fingerprintable declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub kind: EntityKind,
    pub namespaces: Vec<String>,
    pub name: String,
    /// Base declarations by full name, resolved to their fingerprints.
    pub bases: Vec<String>,
    /// Populated for interfaces and libraries.
    pub methods: Vec<Method>,
    /// Populated for structs.
    pub fields: Vec<Field>,
    pub template: Vec<TemplateParameter>,
    /// Concrete template arguments of an instantiation, by type name.
    pub template_arguments: Vec<String>,
    pub legacy: LegacyFlags,
}

impl Declaration {
    pub fn full_name(&self) -> String {
        let mut name = String::new();
        for namespace in &self.namespaces {
            name.push_str(namespace);
            name.push_str("::");
        }

        name.push_str(&self.name);
        name
    }
}

/// The set of declarations known to one generator run.
///
/// Fingerprints are pure functions of the registered declarations, the
/// same registry content always yields the same ordinals.
#[derive(Debug, Default)]
pub struct Registry {
    declarations: HashMap<String, Declaration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, declaration: Declaration) {
        self.declarations
            .insert(declaration.full_name(), declaration);
    }

    pub fn get(&self, full_name: &str) -> Option<&Declaration> {
        self.declarations.get(full_name)
    }

    /// The wire ordinal of a registered declaration.
    ///
    /// # Test
    ///
    /// ```
    /// use zone_rpc_codec::fingerprint::*;
    ///
    /// let mut registry = Registry::new();
    /// registry.insert(Declaration {
    ///     kind: EntityKind::Interface,
    ///     namespaces: vec!["demo".to_string()],
    ///     name: "i_calculator".to_string(),
    ///     bases: vec![],
    ///     methods: vec![Method {
    ///         attributes: vec![],
    ///         name: "square".to_string(),
    ///         parameters: vec![Parameter {
    ///             attributes: vec![],
    ///             type_name: "int32".to_string(),
    ///             modifiers: String::new(),
    ///             name: "value".to_string(),
    ///         }],
    ///     }],
    ///     fields: vec![],
    ///     template: vec![],
    ///     template_arguments: vec![],
    ///     legacy: LegacyFlags::default(),
    /// });
    ///
    /// let first = registry.fingerprint("demo::i_calculator").unwrap();
    /// let second = registry.fingerprint("demo::i_calculator").unwrap();
    ///
    /// // A fingerprint is a pure function of the declaration.
    /// assert_eq!(first, second);
    /// assert!(!first.is_none());
    /// ```
    pub fn fingerprint(&self, full_name: &str) -> Option<InterfaceOrdinal> {
        if !self.declarations.contains_key(full_name) {
            return None;
        }

        let mut stack = Vec::new();
        Some(InterfaceOrdinal::new(self.generate(full_name, &mut stack)))
    }

    /// Hashes one declaration, resolving referenced types recursively.
    /// A declaration already on the stack contributes zero.
    fn generate(&self, full_name: &str, stack: &mut Vec<String>) -> u64 {
        if stack.iter().any(|entry| entry == full_name) {
            return 0;
        }

        let Some(declaration) = self.declarations.get(full_name) else {
            return 0;
        };

        stack.push(full_name.to_string());
        let seed = self.canonical_form(declaration, stack);
        let mut hash = truncate(Sha3_256::digest(seed.as_bytes()).as_slice());

        // Template arguments ratchet into the final value instead of the
        // textual seed, so that an argument which is itself fingerprinted
        // stays a fixed-width contribution.
        if !declaration.template_arguments.is_empty() {
            for argument in &declaration.template_arguments {
                let id = self.type_id(argument, stack);
                let mut hasher = Sha3_256::new();
                hasher.update(hash.to_le_bytes());
                hasher.update(id.to_le_bytes());
                hash = truncate(hasher.finalize().as_slice());
            }
        } else if declaration.legacy.hash_empty_template_args {
            let mut hasher = Sha3_256::new();
            hasher.update(hash.to_le_bytes());
            hash = truncate(hasher.finalize().as_slice());
        }

        stack.pop();
        hash
    }

    /// A referenced type collapses to its fingerprint when registered
    /// and to its literal spelling otherwise, so primitive names stay
    /// readable in the canonical form.
    fn type_id(&self, type_name: &str, stack: &mut Vec<String>) -> u64 {
        if self.declarations.contains_key(type_name) {
            self.generate(type_name, stack)
        } else {
            truncate(Sha3_256::digest(type_name.as_bytes()).as_slice())
        }
    }

    fn type_token(&self, type_name: &str, stack: &mut Vec<String>) -> String {
        if self.declarations.contains_key(type_name) {
            self.generate(type_name, stack).to_string()
        } else {
            type_name.to_string()
        }
    }

    fn canonical_form(&self, declaration: &Declaration, stack: &mut Vec<String>) -> String {
        let mut seed = String::new();

        if !declaration.template.is_empty() {
            seed.push_str("template<");
            for (index, parameter) in declaration.template.iter().enumerate() {
                if index > 0 {
                    seed.push(',');
                }

                seed.push_str(&parameter.kind);
                seed.push(' ');
                seed.push_str(&parameter.name);
            }
            seed.push('>');
        }

        if declaration.kind == EntityKind::Struct {
            seed.push_str("struct ");
        }

        seed.push_str(&declaration.full_name());

        if !declaration.bases.is_empty() {
            seed.push(':');
            for (index, base) in declaration.bases.iter().enumerate() {
                if index > 0 {
                    seed.push(',');
                }

                seed.push_str(&self.type_token(base, stack));
            }
        }

        seed.push('{');
        match declaration.kind {
            EntityKind::Struct => {
                for field in &declaration.fields {
                    seed.push_str(&self.type_token(&field.type_name, stack));
                    seed.push_str(&field.modifiers);
                    seed.push(' ');
                    seed.push_str(&field.name);
                    if !field.array.is_empty() {
                        seed.push('[');
                        seed.push_str(&field.array);
                        seed.push(']');
                    }

                    seed.push(',');
                }
            }
            _ => {
                for method in &declaration.methods {
                    self.push_attributes(&mut seed, &method.attributes, declaration.legacy);
                    seed.push_str(&method.name);
                    seed.push('(');
                    for (index, parameter) in method.parameters.iter().enumerate() {
                        if index > 0 {
                            seed.push(',');
                        }

                        self.push_attributes(&mut seed, &parameter.attributes, declaration.legacy);
                        seed.push_str(&self.type_token(&parameter.type_name, stack));
                        seed.push_str(&parameter.modifiers);
                        seed.push(' ');
                        seed.push_str(&parameter.name);
                    }

                    seed.push(')');
                }
            }
        }
        seed.push('}');

        seed
    }

    fn push_attributes(&self, seed: &mut String, attributes: &[Attribute], legacy: LegacyFlags) {
        for attribute in attributes {
            if attribute.name == DEPRECATED_FUNCTION {
                continue;
            }

            if attribute.name == DEPRECATED && !legacy.keep_deprecated_contamination {
                continue;
            }

            seed.push('[');
            seed.push_str(&attribute.name);
            if !attribute.value.is_empty() {
                seed.push('=');
                seed.push_str(&attribute.value);
            }

            seed.push(']');
        }
    }
}

/// First eight bytes of a digest, little-endian.
fn truncate(digest: &[u8]) -> u64 {
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}
