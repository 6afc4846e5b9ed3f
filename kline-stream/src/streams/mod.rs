/// Idle timeout wrapper ending silent transport streams.
pub mod timeout;
