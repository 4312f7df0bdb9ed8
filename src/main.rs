fn main() -> std::io::Result<()> {
    let (mut forth, options) = tforth::with_cli_args();
    tforth::run(&mut forth, &options)
}
