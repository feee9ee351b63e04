use crate::domain::account::Account;
use crate::error::Result;
use std::io::Write;

/// Writes the final account states as `user,balance,frozen,earned,spent`.
pub struct AccountWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> AccountWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_accounts(&mut self, accounts: impl IntoIterator<Item = Account>) -> Result<()> {
        self.writer
            .write_record(["user", "balance", "frozen", "earned", "spent"])?;
        for account in accounts {
            self.writer.write_record([
                account.user.to_string(),
                account.balance.to_string(),
                account.frozen_balance.to_string(),
                account.total_earned.to_string(),
                account.total_spent.to_string(),
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
