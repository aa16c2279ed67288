fn main() {
    // Tell cargo to rerun the build script if a grammar file changes
    println!("cargo:rerun-if-changed=src/markup.pest");
    println!("cargo:rerun-if-changed=src/lexer.pest");
}
