fn main() {
    // Only the device build needs the ESP-IDF environment; host builds run the simulators.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
