// demos/jsonrpc.rs
use serde_json::Value;
use suil::RpcConfig;
use suil::rpc::{JsonRpcHandler, JsonRpcServer, RpcError};

struct Calculator;

impl JsonRpcHandler for Calculator {
    fn call(&self, method: &str, params: &Value, _id: Option<i64>) -> Result<Value, RpcError> {
        let operands = || -> Result<Vec<i64>, RpcError> {
            params
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_i64).collect())
                .ok_or_else(|| RpcError::invalid_params("params must be an array of integers"))
        };

        match method {
            "add" => Ok(Value::from(operands()?.iter().sum::<i64>())),
            "mul" => Ok(Value::from(operands()?.iter().product::<i64>())),
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

fn main() {
    suil::init_logging();

    println!("JSON-RPC calculator on 0.0.0.0:4500");
    JsonRpcServer::new(Calculator, RpcConfig::default())
        .bind("0.0.0.0:4500")
        .workers(1)
        .serve()
        .unwrap();
}
