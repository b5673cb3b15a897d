use rustrial_k8s_deployment_exposer_apis::ExposePolicy;
use serde_yaml;

/// Print the default expose policy, a starting point for `EXPOSE_POLICY_FILE`.
pub fn main() {
    println!("{}", serde_yaml::to_string(&ExposePolicy::default()).unwrap());
}
