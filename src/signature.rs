//! Signature string helpers
//!
//! Signatures arrive from the instrumentation source as fully qualified
//! strings like `app.server.Handler.dispatch(Request,int)`. Observers and
//! processors usually want shorter forms; these helpers slice the original
//! string without allocating.

/// Strips the package, keeping `Class.method(params)`.
///
/// Returns the input unchanged when it holds fewer than two dots before the
/// parameter list.
pub fn without_package(signature: &str) -> &str {
    let param_idx = signature.find('(').unwrap_or(signature.len());
    let Some(method_idx) = signature[..param_idx].rfind('.') else {
        return signature;
    };
    let Some(class_idx) = signature[..method_idx].rfind('.') else {
        return signature;
    };
    &signature[class_idx + 1..]
}

/// Strips the parameter list, keeping `package.Class.method`.
pub fn without_parameters(signature: &str) -> &str {
    match signature.find('(') {
        Some(idx) => &signature[..idx],
        None => signature,
    }
}

/// The parameter list alone, including parentheses.
pub fn parameter_list(signature: &str) -> &str {
    match signature.find('(') {
        Some(idx) => &signature[idx..],
        None => signature,
    }
}

/// The fully qualified class name, without the method name.
pub fn class_name(signature: &str) -> &str {
    let param_idx = signature.find('(').unwrap_or(signature.len());
    match signature[..param_idx].rfind('.') {
        Some(idx) => &signature[..idx],
        None => signature,
    }
}
