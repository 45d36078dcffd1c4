use serde_json::Value;
use spindle_core::{ReservationId, SpindleError};
use spindle_fetch::{PageRequest, RequestQueuer};
use spindle_plugin::{ArgSpec, InvokeOutcome, Invoker};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The createReservation service.
pub struct InterfaceServer {
    invoker: Arc<Invoker>,
    rq: RequestQueuer,
    scheduler_url: String,
}

impl InterfaceServer {
    pub fn new(invoker: Arc<Invoker>, rq: RequestQueuer, scheduler_url: impl Into<String>) -> Self {
        Self {
            invoker,
            rq,
            scheduler_url: scheduler_url.into(),
        }
    }

    /// Create a reservation.
    ///
    /// Recurring functions (interval > 0) fire synchronously under a fresh
    /// UUID and, on success, the scheduler is told to start firing it on
    /// its interval; the response is `{uuid_hex: first_fire_result}`.
    /// One-shot functions return their value directly.
    pub async fn create_reservation(
        &self,
        function_name: &str,
        kwargs: HashMap<String, String>,
    ) -> Result<Value, SpindleError> {
        let Some((resolved, plugin)) = self.invoker.registry().resolve(function_name) else {
            return Err(SpindleError::UnknownFunction(function_name.to_string()));
        };
        let spec = plugin.arg_spec();
        let args = filter_arguments(&resolved, &spec, kwargs)?;

        if plugin.interval() == 0 {
            return match self.invoker.invoke(&resolved, args, None).await {
                InvokeOutcome::Completed(value) => Ok(value.unwrap_or(Value::Null)),
                InvokeOutcome::Deleted => Ok(Value::Null),
                InvokeOutcome::Failed(message) => Err(SpindleError::Plugin(message)),
            };
        }

        let uuid = ReservationId::generate();
        info!(function = %resolved, uuid = %uuid, "Creating reservation");
        match self.invoker.invoke(&resolved, args, Some(uuid)).await {
            InvokeOutcome::Completed(value) => {
                self.notify_scheduler(&uuid, &resolved).await?;
                let mut response = serde_json::Map::new();
                response.insert(uuid.to_hex(), value.unwrap_or(Value::Null));
                Ok(Value::Object(response))
            }
            InvokeOutcome::Deleted => Err(SpindleError::Plugin(format!(
                "first fire of {} deleted its own reservation",
                resolved
            ))),
            InvokeOutcome::Failed(message) => Err(SpindleError::Plugin(message)),
        }
    }

    /// Tell the scheduler to start firing a reservation. Called exactly
    /// once per successful creation; a failure here is loud, since a
    /// reservation that never joins the heap silently never recurs.
    async fn notify_scheduler(
        &self,
        uuid: &ReservationId,
        function_name: &str,
    ) -> Result<(), SpindleError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("uuid", &uuid.to_hex())
            .append_pair("type", function_name)
            .finish();
        let notify_url = format!(
            "{}/function/schedulerserver/remoteaddtoheap?{}",
            self.scheduler_url.trim_end_matches('/'),
            query
        );
        info!(url = %notify_url, "Notifying scheduler");
        self.rq
            .get_page(PageRequest::get(&notify_url))
            .await
            .map_err(|e| SpindleError::SchedulerUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Startup probe: confirm the configured scheduler answers. Logged,
    /// not fatal — reservations must keep being creatable while a
    /// scheduler restarts.
    pub async fn probe_scheduler(&self) {
        let status_url = format!("{}/status", self.scheduler_url.trim_end_matches('/'));
        match self.rq.get_page(PageRequest::get(&status_url)).await {
            Ok(_) => info!(url = %self.scheduler_url, "Scheduler peer reachable"),
            Err(e) => warn!(url = %self.scheduler_url, error = %e, "Scheduler peer unreachable"),
        }
    }
}

/// Keep required and declared-optional arguments, drop everything else.
/// Missing required arguments fail the request.
fn filter_arguments(
    function_name: &str,
    spec: &ArgSpec,
    mut kwargs: HashMap<String, String>,
) -> Result<HashMap<String, String>, SpindleError> {
    let mut args = HashMap::new();
    for name in &spec.required {
        match kwargs.remove(name) {
            Some(value) => {
                args.insert(name.clone(), value);
            }
            None => {
                return Err(SpindleError::MissingArgument {
                    function: function_name.to_string(),
                    argument: name.clone(),
                });
            }
        }
    }
    for name in &spec.optional {
        if let Some(value) = kwargs.remove(name) {
            args.insert(name.clone(), value);
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_arguments() {
        let spec = ArgSpec::default().required(&["a"]).optional(&["b"]);
        let mut kwargs = HashMap::new();
        kwargs.insert("a".to_string(), "1".to_string());
        kwargs.insert("b".to_string(), "2".to_string());
        kwargs.insert("junk".to_string(), "3".to_string());

        let args = filter_arguments("svc/foo", &spec, kwargs).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args["a"], "1");
        assert_eq!(args["b"], "2");
    }

    #[test]
    fn test_filter_arguments_missing_required() {
        let spec = ArgSpec::default().required(&["a"]);
        let err = filter_arguments("svc/foo", &spec, HashMap::new()).unwrap_err();
        assert!(matches!(err, SpindleError::MissingArgument { .. }));
    }
}
