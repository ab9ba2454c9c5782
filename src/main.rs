fn main() -> anyhow::Result<()> {
    quotebook::cli::run()
}
