//! Type signature splitting.
//!
//! A signature is a sequence of complete types. Basic types are single
//! characters; containers are arrays (`a`), structs (`(...)`), dictionary
//! entries (`a{kv}`) and variants (`v`).

use crate::error::{Result, ValidationError};

/// Maximum length of a signature string.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Maximum container nesting depth.
const MAX_DEPTH: usize = 32;

const BASIC_TYPES: &[u8] = b"ybnqixtdsogh";

fn is_basic(code: u8) -> bool {
    BASIC_TYPES.contains(&code)
}

fn invalid(sig: &str) -> ValidationError {
    ValidationError::InvalidSignature(sig.to_string())
}

/// Return the end offset of the complete type starting at `pos`.
fn complete_type_end(sig: &str, pos: usize, depth: usize) -> Result<usize> {
    if depth > MAX_DEPTH {
        return Err(invalid(sig));
    }
    let bytes = sig.as_bytes();
    let code = *bytes.get(pos).ok_or_else(|| invalid(sig))?;
    match code {
        c if is_basic(c) || c == b'v' => Ok(pos + 1),
        b'a' => {
            if bytes.get(pos + 1) == Some(&b'{') {
                let key = *bytes.get(pos + 2).ok_or_else(|| invalid(sig))?;
                if !is_basic(key) {
                    return Err(invalid(sig));
                }
                let value_end = complete_type_end(sig, pos + 3, depth + 1)?;
                if bytes.get(value_end) == Some(&b'}') {
                    Ok(value_end + 1)
                } else {
                    Err(invalid(sig))
                }
            } else {
                complete_type_end(sig, pos + 1, depth + 1)
            }
        }
        b'(' => {
            let mut cursor = pos + 1;
            if bytes.get(cursor) == Some(&b')') {
                return Err(invalid(sig));
            }
            while bytes.get(cursor) != Some(&b')') {
                cursor = complete_type_end(sig, cursor, depth + 1)?;
            }
            Ok(cursor + 1)
        }
        _ => Err(invalid(sig)),
    }
}

/// Split a signature into its complete types.
///
/// `"sa{sv}(ii)"` yields `["s", "a{sv}", "(ii)"]`. The empty signature
/// yields no types.
pub fn split_signature(sig: &str) -> Result<Vec<&str>> {
    if sig.len() > MAX_SIGNATURE_LEN || !sig.is_ascii() {
        return Err(invalid(sig));
    }
    let mut types = Vec::new();
    let mut pos = 0;
    while pos < sig.len() {
        let end = complete_type_end(sig, pos, 0)?;
        types.push(sig.get(pos..end).ok_or_else(|| invalid(sig))?);
        pos = end;
    }
    Ok(types)
}

/// Validate a signature without keeping the split.
pub fn validate_signature(sig: &str) -> Result<()> {
    split_signature(sig).map(|_| ())
}
