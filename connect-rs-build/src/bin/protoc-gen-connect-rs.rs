fn main() -> std::io::Result<()> {
    connect_rs_build::plugin::run()
}
