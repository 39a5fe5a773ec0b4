// src/bin/nila-rp-login.rs
//
// Walks through a complete login from the terminal: start the login, open the
// printed URL in a browser, paste the URL the provider redirects back to, and
// the verified claims are shown before the session is logged out again.

use nila_oidc_rp::model::{CallbackParams, IdentityClaims};
use nila_oidc_rp::prelude::*;
use std::error::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "nila-rp.yaml".to_string());
    let config = Config::from_yaml_file(&config_path)?;
    info!(issuer = %config.issuer, client_id = %config.client_id, "Loaded configuration from {}", config_path);

    let home = config.redirect_uri.join("/")?;
    let rp = RelyingParty::new(config)?;
    let key_refresh = rp.provider().spawn_key_refresh();
    let session_id = RelyingParty::new_session_id();

    match rp.current_session(&session_id).await? {
        Some(session) => print_claims(&session.claims),
        None => println!("Not logged in."),
    }

    let request = rp.begin_login(&session_id).await?;
    println!("\nOpen this URL in your browser to log in:\n\n  {}\n", request.url);
    println!("After logging in, paste the full URL you were redirected to:");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = tokio::select! {
        line = lines.next_line() => line?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nAborted.");
            key_refresh.abort();
            return Ok(());
        }
    };
    let callback = parse_callback(line.as_deref().unwrap_or_default());

    match rp.complete_login(&session_id, &callback).await {
        Ok(session) => {
            println!("\nLogin successful.\n");
            print_claims(&session.claims);
            if let Some(expires_at) = session
                .access_token_expires_at
                .and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0))
            {
                println!("  Access token expires: {expires_at}");
            }
            println!("  Refresh token:        {}", if session.refresh_token.is_some() { "yes" } else { "no" });
        }
        Err(err) => {
            println!("\nLogin failed: {err}");
            if err.is_security_violation() {
                println!("The callback was rejected for security reasons; start a new login.");
            }
        }
    }

    match rp.logout(&session_id, Some(&home)).await? {
        Some(url) => println!("\nLogged out locally. End the provider session at:\n\n  {url}\n"),
        None => println!("\nLogged out."),
    }

    key_refresh.abort();
    Ok(())
}

fn parse_callback(input: &str) -> CallbackParams {
    let input = input.trim();
    match Url::parse(input) {
        Ok(url) => CallbackParams::from_url(&url),
        Err(_) => CallbackParams::from_query(input.trim_start_matches('?')),
    }
}

fn print_claims(claims: &IdentityClaims) {
    println!("  Subject (sub):        {}", claims.sub);
    println!("  Issuer (iss):         {}", claims.iss);
    println!("  Audience (aud):       {}", claims.aud);
    if let Some(name) = &claims.name {
        println!("  Name:                 {name}");
    }
    if let Some(username) = &claims.preferred_username {
        println!("  Username:             {username}");
    }
    if let Some(email) = &claims.email {
        let verified = match claims.email_verified {
            Some(true) => " (verified)",
            Some(false) => " (unverified)",
            None => "",
        };
        println!("  Email:                {email}{verified}");
    }
    if let Some(iat) = claims.issued_at() {
        println!("  Issued at (iat):      {iat}");
    }
    if let Some(exp) = claims.expires_at() {
        println!("  Expires (exp):        {exp}");
    }
    if let Some(auth_time) = claims.authenticated_at() {
        println!("  Authenticated at:     {auth_time}");
    }
    if !claims.additional.is_empty() {
        println!("  Other claims:");
        for (name, value) in &claims.additional {
            println!("    {name}: {value}");
        }
    }
}
