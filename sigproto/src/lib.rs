pub mod signalservice {
    include!("signalservice.rs");
}
