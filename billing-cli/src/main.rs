//! Billing CLI
//!
//! Command-line interface for the Billing API.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;

use billing_client::BillingClient;
use billing_types::{
    BillingCycle, CancelRequest, CreatePaymentLinkRequest, Currency, PaymentIntentId,
    PaymentMethod, PaymentProvider, PaymentPurpose, PurchaseOrder, PurchaseRequest,
    PurchaseResponse, RenewRequest, SubscriptionGrant, SubscriptionId,
};

#[derive(Parser)]
#[command(name = "billing")]
#[command(author, version, about = "Billing API CLI client", long_about = None)]
struct Cli {
    /// Base URL of the Billing API
    #[arg(long, env = "BILLING_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// API key for authentication
    #[arg(long, env = "BILLING_API_KEY")]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },
    /// Hosted payment operations
    Payment {
        #[command(subcommand)]
        action: PaymentCommands,
    },
    /// Subscription operations
    Subscription {
        #[command(subcommand)]
        action: SubscriptionCommands,
    },
    /// Show current exchange rates
    Rates,
    /// Show per-currency amount limits
    Limits,
    /// Check API health
    Health,
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Show an owner's wallet
    Get { owner: String },
    /// List an owner's ledger entries
    Transactions {
        owner: String,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Buy a course, plan, or renewal from the wallet balance
    Purchase {
        owner: String,
        #[arg(long)]
        amount: String,
        #[arg(long, default_value = "USD")]
        currency: String,
        /// Idempotency reference; generated when omitted
        #[arg(long)]
        reference: Option<String>,
        #[command(flatten)]
        order: OrderArgs,
    },
    /// Stop all money movement on a wallet
    Freeze { owner: String },
    Unfreeze { owner: String },
}

#[derive(Subcommand)]
enum PaymentCommands {
    /// Create a hosted payment link
    Link {
        /// Wallet owner the payment credits
        #[arg(long)]
        payer: String,
        #[arg(long)]
        amount: String,
        #[arg(long, default_value = "USD")]
        currency: String,
        /// SANDBOX, STRIPE, PAYMOB or KASHIER
        #[arg(long, default_value = "SANDBOX")]
        provider: String,
        #[arg(long, default_value = "CARD")]
        method: String,
        /// Marks a deliberate repeat of an identical charge
        #[arg(long)]
        nonce: Option<String>,
        #[command(flatten)]
        order: OrderArgs,
    },
    /// Show a payment's status
    Status {
        #[arg(long, default_value = "SANDBOX")]
        provider: String,
        id: String,
        /// Poll the provider until the payment settles
        #[arg(long)]
        wait: bool,
    },
}

#[derive(Subcommand)]
enum SubscriptionCommands {
    Get { id: String },
    /// List the subscriptions held by a user or organization
    List { owner: String },
    Renew {
        id: String,
        #[arg(long)]
        amount: Option<String>,
        #[arg(long)]
        transaction_id: Option<String>,
    },
    Cancel {
        id: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        by: String,
        /// Amount credited back to the owner's wallet
        #[arg(long)]
        refund: Option<String>,
    },
    Suspend {
        id: String,
        #[arg(long)]
        reason: String,
    },
    Resume { id: String },
}

/// What is being bought; no flags means a plain wallet top-up.
#[derive(Args)]
struct OrderArgs {
    /// Course to grant to the payer
    #[arg(long, conflicts_with_all = ["plan", "renew"])]
    course: Option<String>,
    /// Plan to subscribe the payer to
    #[arg(long, conflicts_with = "renew")]
    plan: Option<String>,
    /// Subscribe this organization to the plan instead of the payer
    #[arg(long, requires = "plan")]
    organization: Option<String>,
    #[arg(long, default_value_t = 1)]
    seats: u32,
    /// MONTHLY, YEARLY or ONE_TIME
    #[arg(long, default_value = "MONTHLY")]
    cycle: String,
    /// Subscription to pay the next period of
    #[arg(long)]
    renew: Option<String>,
}

impl OrderArgs {
    fn order(&self, payer: &str) -> Result<Option<PurchaseOrder>> {
        if let Some(id) = &self.renew {
            return Ok(Some(PurchaseOrder::Renewal {
                subscription_id: parse(id, "subscription id")?,
            }));
        }
        let grant = match (&self.course, &self.plan, &self.organization) {
            (Some(course), _, _) => {
                return Ok(Some(PurchaseOrder::Grant {
                    grant: SubscriptionGrant::UserCourse {
                        user_id: payer.to_string(),
                        course_id: course.clone(),
                    },
                    billing_cycle: BillingCycle::OneTime,
                }));
            }
            (None, Some(plan), Some(org)) => SubscriptionGrant::OrgPlan {
                organization_id: org.clone(),
                plan_id: plan.clone(),
                seats: self.seats,
            },
            (None, Some(plan), None) => SubscriptionGrant::UserPlan {
                user_id: payer.to_string(),
                plan_id: plan.clone(),
            },
            (None, None, _) => return Ok(None),
        };
        Ok(Some(PurchaseOrder::Grant {
            grant,
            billing_cycle: parse(&self.cycle, "billing cycle")?,
        }))
    }
}

fn parse<T>(s: &str, what: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    s.parse()
        .map_err(|e| anyhow::anyhow!("Invalid {} `{}`: {}", what, s, e))
}

fn parse_amount(s: &str) -> Result<Decimal> {
    parse(s, "amount")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut client = BillingClient::new(&cli.api_url);
    if let Some(key) = cli.api_key {
        client = client.with_api_key(key);
    }

    match cli.command {
        Commands::Health => {
            let healthy = client.health().await?;
            if healthy {
                println!("✓ API is healthy");
            } else {
                println!("✗ API is not healthy");
                std::process::exit(1);
            }
        }

        Commands::Rates => print_json(&client.rates().await?)?,
        Commands::Limits => print_json(&client.amount_limits().await?)?,

        Commands::Wallet { action } => match action {
            WalletCommands::Get { owner } => print_json(&client.wallet(&owner).await?)?,
            WalletCommands::Transactions { owner, page, limit } => {
                print_json(&client.transactions(&owner, page, limit).await?)?
            }
            WalletCommands::Purchase {
                owner,
                amount,
                currency,
                reference,
                order,
            } => {
                let Some(order) = order.order(&owner)? else {
                    anyhow::bail!("A purchase needs --course, --plan or --renew");
                };
                let req = PurchaseRequest {
                    order,
                    amount: parse_amount(&amount)?,
                    currency: parse::<Currency>(&currency, "currency")?,
                    reference: reference.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                };
                let response = client.purchase(&owner, &req).await?;
                print_json(&response)?;
                if let PurchaseResponse::InsufficientBalance { .. } = response {
                    std::process::exit(2);
                }
            }
            WalletCommands::Freeze { owner } => print_json(&client.freeze_wallet(&owner).await?)?,
            WalletCommands::Unfreeze { owner } => {
                print_json(&client.unfreeze_wallet(&owner).await?)?
            }
        },

        Commands::Payment { action } => match action {
            PaymentCommands::Link {
                payer,
                amount,
                currency,
                provider,
                method,
                nonce,
                order,
            } => {
                let order = order.order(&payer)?;
                let purpose = order
                    .as_ref()
                    .map(PurchaseOrder::purpose)
                    .unwrap_or(PaymentPurpose::WalletCredit);
                let req = CreatePaymentLinkRequest {
                    amount: parse_amount(&amount)?,
                    currency: parse::<Currency>(&currency, "currency")?,
                    provider: parse::<PaymentProvider>(&provider, "provider")?,
                    method: parse::<PaymentMethod>(&method, "payment method")?,
                    purpose,
                    payer_ref: payer,
                    order,
                    nonce,
                    metadata: None,
                };
                let link = client.create_payment_link(&req).await?;
                print_json(&link)?;
            }
            PaymentCommands::Status { provider, id, wait } => {
                let provider = parse::<PaymentProvider>(&provider, "provider")?;
                let id: PaymentIntentId = parse(&id, "payment id")?;
                print_json(&client.payment_status(provider, id, wait).await?)?;
            }
        },

        Commands::Subscription { action } => match action {
            SubscriptionCommands::Get { id } => {
                let id: SubscriptionId = parse(&id, "subscription id")?;
                print_json(&client.subscription(id).await?)?;
            }
            SubscriptionCommands::List { owner } => {
                print_json(&client.owner_subscriptions(&owner).await?)?
            }
            SubscriptionCommands::Renew {
                id,
                amount,
                transaction_id,
            } => {
                let id: SubscriptionId = parse(&id, "subscription id")?;
                let req = RenewRequest {
                    amount: amount.as_deref().map(parse_amount).transpose()?,
                    transaction_id,
                };
                print_json(&client.renew_subscription(id, &req).await?)?;
            }
            SubscriptionCommands::Cancel {
                id,
                reason,
                by,
                refund,
            } => {
                let id: SubscriptionId = parse(&id, "subscription id")?;
                let req = CancelRequest {
                    reason,
                    cancelled_by: by,
                    refund_amount: refund.as_deref().map(parse_amount).transpose()?,
                };
                print_json(&client.cancel_subscription(id, &req).await?)?;
            }
            SubscriptionCommands::Suspend { id, reason } => {
                let id: SubscriptionId = parse(&id, "subscription id")?;
                print_json(&client.suspend_subscription(id, &reason).await?)?;
            }
            SubscriptionCommands::Resume { id } => {
                let id: SubscriptionId = parse(&id, "subscription id")?;
                print_json(&client.resume_subscription(id).await?)?;
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_args(course: Option<&str>, plan: Option<&str>, org: Option<&str>) -> OrderArgs {
        OrderArgs {
            course: course.map(String::from),
            plan: plan.map(String::from),
            organization: org.map(String::from),
            seats: 5,
            cycle: "yearly".into(),
            renew: None,
        }
    }

    #[test]
    fn test_no_order_flags_is_a_top_up() {
        assert!(order_args(None, None, None).order("user_1").unwrap().is_none());
    }

    #[test]
    fn test_course_order_is_one_time() {
        let order = order_args(Some("rust-101"), None, None)
            .order("user_1")
            .unwrap()
            .unwrap();
        assert_eq!(order.purpose(), PaymentPurpose::CoursePurchase);
        match order {
            PurchaseOrder::Grant { billing_cycle, .. } => {
                assert_eq!(billing_cycle, BillingCycle::OneTime)
            }
            other => panic!("unexpected order: {:?}", other),
        }
    }

    #[test]
    fn test_org_plan_order() {
        let order = order_args(None, Some("team"), Some("org_9"))
            .order("user_1")
            .unwrap()
            .unwrap();
        match order {
            PurchaseOrder::Grant {
                grant: SubscriptionGrant::OrgPlan { organization_id, seats, .. },
                billing_cycle,
            } => {
                assert_eq!(organization_id, "org_9");
                assert_eq!(seats, 5);
                assert_eq!(billing_cycle, BillingCycle::Yearly);
            }
            other => panic!("unexpected order: {:?}", other),
        }
    }

    #[test]
    fn test_renewal_needs_valid_id() {
        let mut args = order_args(None, None, None);
        args.renew = Some("not-a-uuid".into());
        assert!(args.order("user_1").is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
