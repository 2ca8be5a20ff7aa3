#![deny(clippy::print_stdout, clippy::print_stderr)]

mod error;
mod facade;
pub mod handlers;
mod interceptor;
mod retry;
mod telemetry;

pub use error::ErrorCode;
pub use error::ErrorEnvelope;
pub use facade::ActorContext;
pub use facade::ApiResult;
pub use facade::DepositParams;
pub use facade::TransferParams;
pub use facade::WalletFacade;
pub use facade::WithdrawalParams;
pub use interceptor::ApprovalInterceptor;
pub use interceptor::ApprovalTypeConfig;
pub use interceptor::EndpointBinding;
pub use interceptor::InterceptResponse;
pub use retry::RetryPolicy;
pub use retry::retry_with_backoff;
pub use telemetry::TelemetryCounters;
pub use telemetry::WalletTelemetry;
