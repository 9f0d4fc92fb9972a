//! Binary entry point: hands off to the library initializer.

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    lib_bastion::init().await
}
