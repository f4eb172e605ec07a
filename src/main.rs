fn main() -> anyhow::Result<()> {
    pluto_chat::run()
}
