fn main() -> anyhow::Result<()> {
    notes_browser::cli::run()
}
