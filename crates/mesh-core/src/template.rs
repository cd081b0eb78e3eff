//! Secret placeholder substitution
//!
//! Marble environment variables and files are declared as templates in the
//! manifest. Placeholders take the Go-template shaped forms
//!
//! - `{{ .Secrets.name }}` / `{{.Secrets.name}}`
//! - `{{ raw .Secrets.name }}` / `{{raw .Secrets.name}}`
//! - any of the above with a `.Cert`, `.Public` or `.Private` field suffix
//!
//! Rendering is a single left-to-right pass over the template: each action is
//! located once and replaced in place, so the cost is linear in the template
//! length regardless of how many secrets are referenced. Actions that are not
//! secret references are copied through untouched.

use std::collections::{BTreeMap, HashMap};

use crate::error::TemplateError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const SECRETS_PREFIX: &str = ".Secrets.";

/// Which part of a secret a placeholder selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecretField {
    /// Private material (symmetric key bytes, private key PEM, plain value)
    Private,
    /// Public key PEM
    Public,
    /// Certificate PEM
    Cert,
}

impl SecretField {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Private" => Some(SecretField::Private),
            "Public" => Some(SecretField::Public),
            "Cert" => Some(SecretField::Cert),
            _ => None,
        }
    }

    /// Field name as written in templates
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretField::Private => "Private",
            SecretField::Public => "Public",
            SecretField::Cert => "Cert",
        }
    }
}

/// A parsed `{{ .Secrets.name[.Field] }}` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretRef {
    pub name: String,
    pub field: SecretField,
}

/// Source of secret bytes for rendering
pub trait SecretLookup {
    /// Resolve one field of a named secret
    fn secret(&self, name: &str, field: SecretField) -> Result<&[u8], TemplateError>;
}

fn private_only<'a, S: AsRef<[u8]>>(
    value: Option<&'a S>,
    name: &str,
    field: SecretField,
) -> Result<&'a [u8], TemplateError> {
    let value = value.ok_or_else(|| TemplateError::MissingSecret { name: name.to_string() })?;
    match field {
        SecretField::Private => Ok(value.as_ref()),
        other => Err(TemplateError::MissingField {
            name: name.to_string(),
            field: other.as_str().to_string(),
        }),
    }
}

impl<S: AsRef<[u8]>> SecretLookup for BTreeMap<String, S> {
    fn secret(&self, name: &str, field: SecretField) -> Result<&[u8], TemplateError> {
        private_only(self.get(name), name, field)
    }
}

impl<S: AsRef<[u8]>> SecretLookup for HashMap<String, S> {
    fn secret(&self, name: &str, field: SecretField) -> Result<&[u8], TemplateError> {
        private_only(self.get(name), name, field)
    }
}

/// Parse the body of a `{{ ... }}` action into a secret reference
fn parse_action(body: &str) -> Option<SecretRef> {
    let mut body = body.trim();
    if let Some(rest) = body.strip_prefix("raw") {
        if rest.starts_with(char::is_whitespace) {
            body = rest.trim_start();
        }
    }

    let path = body.strip_prefix(SECRETS_PREFIX)?;
    if path.is_empty() || path.contains(char::is_whitespace) {
        return None;
    }

    if let Some((name, field)) = path.rsplit_once('.') {
        if let Some(field) = SecretField::parse(field) {
            if name.is_empty() {
                return None;
            }
            return Some(SecretRef {
                name: name.to_string(),
                field,
            });
        }
    }

    Some(SecretRef {
        name: path.to_string(),
        field: SecretField::Private,
    })
}

/// A piece of a template: literal text or a secret reference
enum Piece<'t> {
    Literal(&'t str),
    Secret(SecretRef),
}

/// Walk `template`, handing each literal chunk and each secret reference to
/// the visitor in order of appearance.
fn walk<'t, E>(
    template: &'t str,
    mut visit: impl FnMut(Piece<'t>) -> Result<(), E>,
) -> Result<(), E> {
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };

        let action_len = OPEN.len() + end + CLOSE.len();
        match parse_action(&after_open[..end]) {
            Some(secret_ref) => {
                visit(Piece::Literal(&rest[..start]))?;
                visit(Piece::Secret(secret_ref))?;
            }
            None => visit(Piece::Literal(&rest[..start + action_len]))?,
        }
        rest = &rest[start + action_len..];
    }
    visit(Piece::Literal(rest))
}

/// Collect every secret referenced by `template`, in order of appearance
pub fn references(template: &str) -> Vec<SecretRef> {
    let mut refs = Vec::new();
    let _ = walk::<std::convert::Infallible>(template, |piece| {
        if let Piece::Secret(secret_ref) = piece {
            refs.push(secret_ref);
        }
        Ok(())
    });
    refs
}

/// Render `template`, substituting secret bytes verbatim
pub fn render_bytes<L: SecretLookup + ?Sized>(
    template: &str,
    lookup: &L,
) -> Result<Vec<u8>, TemplateError> {
    let mut out = Vec::with_capacity(template.len());
    walk(template, |piece| {
        match piece {
            Piece::Literal(chunk) => out.extend_from_slice(chunk.as_bytes()),
            Piece::Secret(secret_ref) => {
                out.extend_from_slice(lookup.secret(&secret_ref.name, secret_ref.field)?)
            }
        }
        Ok(())
    })?;
    Ok(out)
}

/// Render `template` to a string; non-UTF-8 secret bytes are replaced lossily
pub fn render<L: SecretLookup + ?Sized>(template: &str, lookup: &L) -> Result<String, TemplateError> {
    let bytes = render_bytes(template, lookup)?;
    Ok(match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> BTreeMap<String, Vec<u8>> {
        let mut map = BTreeMap::new();
        map.insert("token".to_string(), b"s3cr3t".to_vec());
        map.insert("db".to_string(), b"postgres://x".to_vec());
        map
    }

    #[test]
    fn test_all_placeholder_spellings() {
        let s = secrets();
        assert_eq!(render("{{ .Secrets.token }}", &s).unwrap(), "s3cr3t");
        assert_eq!(render("{{.Secrets.token}}", &s).unwrap(), "s3cr3t");
        assert_eq!(render("{{ raw .Secrets.token }}", &s).unwrap(), "s3cr3t");
        assert_eq!(render("{{raw .Secrets.token}}", &s).unwrap(), "s3cr3t");
    }

    #[test]
    fn test_multiple_and_repeated_references() {
        let s = secrets();
        let out = render("a={{ .Secrets.token }} b={{ .Secrets.db }} c={{.Secrets.token}}", &s).unwrap();
        assert_eq!(out, "a=s3cr3t b=postgres://x c=s3cr3t");
    }

    #[test]
    fn test_unrelated_actions_are_preserved() {
        let s = secrets();
        let out = render("{{ .Env.HOME }}/{{ .Secrets.token }} {{ unterminated", &s).unwrap();
        assert_eq!(out, "{{ .Env.HOME }}/s3cr3t {{ unterminated");
    }

    #[test]
    fn test_substituted_value_is_not_rescanned() {
        let mut s = BTreeMap::new();
        s.insert("a".to_string(), b"{{ .Secrets.b }}".to_vec());
        s.insert("b".to_string(), b"leak".to_vec());
        assert_eq!(render("{{ .Secrets.a }}", &s).unwrap(), "{{ .Secrets.b }}");
    }

    #[test]
    fn test_missing_secret_fails() {
        let s = secrets();
        let err = render("{{ .Secrets.nope }}", &s).unwrap_err();
        assert_eq!(err, TemplateError::MissingSecret { name: "nope".into() });
    }

    #[test]
    fn test_field_suffix_requires_structured_lookup() {
        let s = secrets();
        let err = render("{{ .Secrets.token.Cert }}", &s).unwrap_err();
        assert!(matches!(err, TemplateError::MissingField { .. }));
    }

    #[test]
    fn test_references_in_order() {
        let refs = references("{{ .Secrets.a }} x {{ raw .Secrets.b.Cert }} {{ .Other }}");
        assert_eq!(
            refs,
            vec![
                SecretRef { name: "a".into(), field: SecretField::Private },
                SecretRef { name: "b".into(), field: SecretField::Cert },
            ]
        );
    }

    #[test]
    fn test_unknown_suffix_is_part_of_name() {
        let refs = references("{{ .Secrets.api.key }}");
        assert_eq!(refs[0].name, "api.key");
        assert_eq!(refs[0].field, SecretField::Private);
    }

    #[test]
    fn test_binary_secret_bytes_preserved_in_bytes_mode() {
        let mut s = BTreeMap::new();
        s.insert("k".to_string(), vec![0xff, 0x00, 0x10]);
        assert_eq!(render_bytes("[{{ .Secrets.k }}]", &s).unwrap(), vec![b'[', 0xff, 0x00, 0x10, b']']);
    }
}
