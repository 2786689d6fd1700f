/// Demangles a symbol name, trying Rust mangling first and Itanium C++
/// second. Returns the name unchanged when no scheme matches.
pub fn demangle_name(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{demangled:#}");
    }

    if name.starts_with('_') {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = symbol.demangle(&options) {
                return demangled;
            }
        }
    }

    name.to_owned()
}
