//! Represents parsed manifest strings with embedded variable references, e.g.
//! `c++ $in -o $out`, and mechanisms for expanding those into plain strings.

use std::borrow::Cow;
use std::collections::HashMap;

/// An environment providing a mapping of variable name to variable value.
/// A given EvalString may be expanded against a stack of environments; the
/// first env that knows the variable wins.
pub trait Env {
    fn get_var(&self, var: &str) -> Option<Cow<str>>;
}

/// One token within an EvalString, either literal text or a variable reference.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalPart<T: AsRef<str>> {
    Literal(T),
    VarRef(T),
}

/// A parsed but unexpanded variable-reference string, e.g. "cc $in -o $out".
/// This is generic to support EvalString<&str>, which is used for
/// immediately-expanded evals like top-level bindings, and EvalString<String>,
/// which is used for delayed evals like in `rule` blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalString<T: AsRef<str>>(Vec<EvalPart<T>>);

impl<T: AsRef<str>> EvalString<T> {
    pub fn new(parts: Vec<EvalPart<T>>) -> Self {
        EvalString(parts)
    }

    pub fn evaluate(&self, envs: &[&dyn Env]) -> String {
        let mut val = String::new();
        for part in &self.0 {
            match part {
                EvalPart::Literal(s) => val.push_str(s.as_ref()),
                EvalPart::VarRef(v) => {
                    for env in envs {
                        if let Some(v) = env.get_var(v.as_ref()) {
                            val.push_str(&v);
                            break;
                        }
                    }
                }
            }
        }
        val
    }
}

impl EvalString<&str> {
    pub fn into_owned(self) -> EvalString<String> {
        EvalString(
            self.0
                .into_iter()
                .map(|part| match part {
                    EvalPart::Literal(s) => EvalPart::Literal(s.to_owned()),
                    EvalPart::VarRef(s) => EvalPart::VarRef(s.to_owned()),
                })
                .collect(),
        )
    }
}

/// File-scope variable bindings, fully evaluated as they are read.
#[derive(Debug, Default, Clone)]
pub struct Vars(HashMap<String, String>);

impl Vars {
    pub fn insert(&mut self, key: impl Into<String>, val: String) {
        self.0.insert(key.into(), val);
    }
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }
}

impl Env for Vars {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.0.get(var).map(|v| Cow::Borrowed(v.as_str()))
    }
}

// Impl for the evaluated variables attached to a build statement.
impl Env for crate::smallmap::SmallMap<String, String> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.get(var).map(|v| Cow::Borrowed(v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_order() {
        let mut a = Vars::default();
        a.insert("x", "first".to_string());
        let mut b = Vars::default();
        b.insert("x", "second".to_string());
        b.insert("y", "only".to_string());
        let es = EvalString::new(vec![
            EvalPart::VarRef("x"),
            EvalPart::Literal(" "),
            EvalPart::VarRef("y"),
            EvalPart::VarRef("z"),
        ]);
        assert_eq!(es.evaluate(&[&a, &b]), "first only");
    }
}
