//! `-version` support: print `<package name> <version>` and nothing else.

pub fn print() {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
}
