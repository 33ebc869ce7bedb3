//! TLS 证书加载。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use tracing::info;

use crate::config::ServeArgs;

/// 同时提供证书与私钥时返回 Rustls 配置，否则以明文 HTTP 运行。
pub async fn load_rustls_config(args: &ServeArgs) -> io::Result<Option<RustlsConfig>> {
    let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) else {
        return Ok(None);
    };
    info!(cert = ?cert, "loading TLS certificate");
    RustlsConfig::from_pem_file(cert, key).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::config::{Cli, Command};

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let mut argv = vec!["axo-share", "serve"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("parse").command {
            Command::Serve(args) => args,
            Command::Upload(_) => panic!("expected serve command"),
        }
    }

    #[tokio::test]
    async fn plain_http_without_certificate() {
        let config = load_rustls_config(&serve_args(&[])).await.expect("load");
        assert!(config.is_none());
    }

    #[tokio::test]
    async fn missing_certificate_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cert = temp.path().join("cert.pem");
        let key = temp.path().join("key.pem");
        let args = serve_args(&[
            "--tls-cert",
            cert.to_str().expect("utf8"),
            "--tls-key",
            key.to_str().expect("utf8"),
        ]);
        assert!(load_rustls_config(&args).await.is_err());
    }
}
