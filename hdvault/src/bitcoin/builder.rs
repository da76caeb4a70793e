use crate::bitcoin::fee::{FeeChoice, FeePolicy};
use crate::bitcoin::keys::{KeyChain, SigningKeys};
use crate::error::Error;
use crate::ledger::{Ledger, SpendableOutput};
use ::bitcoin::absolute::LockTime;
use ::bitcoin::bip32::Xpriv;
use ::bitcoin::script::PushBytesBuf;
use ::bitcoin::transaction::Version;
use ::bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Largest payload relayed in a data carrier output.
pub const MAX_OP_RETURN_PAYLOAD: usize = 80;

const P2WPKH_SIGNATURE_LENGTH: usize = 72;
const P2WPKH_PUBLIC_KEY_LENGTH: usize = 33;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
    pub subtract_fee: bool,
}

impl Recipient {
    pub fn new(address: &Address, amount: Amount) -> Self {
        Self {
            script_pubkey: address.script_pubkey(),
            amount,
            subtract_fee: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub account: u32,
    pub recipients: Vec<Recipient>,
    pub min_confirmations: u32,
    pub fee: FeeChoice,
    /// Payload of an optional zero-value `OP_RETURN` output.
    pub op_return: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltTransaction {
    pub transaction: Transaction,
    pub fee: Amount,
    pub inputs: Vec<SpendableOutput>,
    pub change: Option<TxOut>,
}

/// Decides which outputs fund a transaction.
pub trait CoinSelection: Send + Sync {
    /// Orders `candidates` by preference and returns how many of them, taken
    /// from the front, cover `target`. The builder takes further candidates
    /// in the same order if the fee is not covered.
    fn select(&self, candidates: &mut [SpendableOutput], target: Amount) -> usize;
}

/// Confirmed outputs first, larger before smaller, until the sum exceeds
/// the target. Keeps the input count low; it does not look for the
/// smallest input set.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFirst;

impl CoinSelection for LargestFirst {
    fn select(&self, candidates: &mut [SpendableOutput], target: Amount) -> usize {
        candidates.sort_by(|a, b| {
            (b.confirmations > 0)
                .cmp(&(a.confirmations > 0))
                .then_with(|| b.amount().cmp(&a.amount()))
        });

        let mut sum = Amount::ZERO;
        let mut count = 0;
        for candidate in candidates.iter() {
            if sum > target {
                break;
            }
            sum += candidate.amount();
            count += 1;
        }

        count
    }
}

#[derive(Default)]
struct BuildContext {
    outputs: Vec<TxOut>,
    target: Amount,
    candidates: Vec<SpendableOutput>,
    selected: usize,
    master: Option<Xpriv>,
    scripts: HashMap<i64, ScriptBuf>,
    keys: SigningKeys,
    change_script: Option<ScriptBuf>,
    change: Option<TxOut>,
    fee: Amount,
}

impl BuildContext {
    fn inputs(&self) -> &[SpendableOutput] {
        &self.candidates[..self.selected]
    }

    fn input_sum(&self) -> Amount {
        self.inputs().iter().map(SpendableOutput::amount).sum()
    }
}

pub struct TransactionBuilder {
    ledger: Arc<Ledger>,
    fee_policy: Arc<dyn FeePolicy>,
    coin_selection: Arc<dyn CoinSelection>,
    min_tx_fee: Amount,
}

impl TransactionBuilder {
    pub fn new(ledger: Arc<Ledger>, fee_policy: Arc<dyn FeePolicy>, min_tx_fee: Amount) -> Self {
        Self {
            ledger,
            fee_policy,
            coin_selection: Arc::new(LargestFirst),
            min_tx_fee,
        }
    }

    pub fn with_coin_selection(mut self, coin_selection: Arc<dyn CoinSelection>) -> Self {
        self.coin_selection = coin_selection;
        self
    }

    /// Builds and signs a transaction paying `request.recipients` from the
    /// account. Nothing is reserved or broadcast.
    pub async fn build(&self, request: &BuildRequest, passphrase: &str) -> Result<BuiltTransaction> {
        let mut context = BuildContext::default();

        add_recipients(&mut context, request)?;
        add_op_return(&mut context, request)?;
        self.add_coins(&mut context, request).await?;
        self.add_secrets(&mut context, request, passphrase).await?;
        self.add_change_address(&mut context, request).await?;
        self.add_fee(&mut context, request)?;

        let (transaction, prevouts) = self.sign(&context)?;

        let errors = verify(self.ledger.keys(), &transaction, &prevouts, self.min_tx_fee);
        if !errors.is_empty() {
            bail!(Error::Verification(errors.join(" - ")))
        }

        tracing::info!(
            txid = %transaction.compute_txid(),
            account = request.account,
            inputs = context.selected,
            fee = %context.fee,
            "Built transaction"
        );

        Ok(BuiltTransaction {
            transaction,
            fee: context.fee,
            inputs: context.inputs().to_vec(),
            change: context.change,
        })
    }

    async fn add_coins(&self, context: &mut BuildContext, request: &BuildRequest) -> Result<()> {
        context.candidates = self
            .ledger
            .spendable(request.account, request.min_confirmations)
            .await?;

        if context.candidates.is_empty() {
            bail!(Error::InsufficientFunds("No spendable outputs found".to_owned()))
        }

        let balance: Amount = context.candidates.iter().map(SpendableOutput::amount).sum();
        if balance < context.target {
            bail!(Error::InsufficientFunds(format!(
                "Balance of {} is less than the {} to send",
                balance, context.target
            )))
        }

        context.selected = self
            .coin_selection
            .select(&mut context.candidates, context.target)
            .min(context.candidates.len());

        Ok(())
    }

    async fn add_secrets(
        &self,
        context: &mut BuildContext,
        request: &BuildRequest,
        passphrase: &str,
    ) -> Result<()> {
        context.master = Some(self.ledger.master_key(request.account, passphrase).await?);
        self.derive_missing_keys(context, request.account)
    }

    fn derive_missing_keys(&self, context: &mut BuildContext, account: u32) -> Result<()> {
        let master = context.master.clone().context("Seed was not decrypted")?;
        let mut seen = HashSet::new();

        for input in &context.candidates[..context.selected] {
            if context.scripts.contains_key(&input.address_id) || !seen.insert(input.address_id) {
                continue;
            }

            let (script, key) = self.ledger.keys().signing_key(
                &master,
                account,
                input.is_change,
                input.derivation_index,
            )?;
            context.scripts.insert(input.address_id, script.clone());
            context.keys.insert(script, key);
        }

        Ok(())
    }

    async fn add_change_address(&self, context: &mut BuildContext, request: &BuildRequest) -> Result<()> {
        let change = self.ledger.new_address(request.account, true).await?;
        context.change_script = Some(change.address.script_pubkey());

        Ok(())
    }

    fn add_fee(&self, context: &mut BuildContext, request: &BuildRequest) -> Result<()> {
        let change_script = context
            .change_script
            .clone()
            .context("Change address must be allocated before the fee")?;

        let (input_sum, fee) = loop {
            let input_sum = context.input_sum();
            let vsize = estimate_vsize(context.selected, &context.outputs, &change_script);
            let fee = request
                .fee
                .resolve(self.fee_policy.as_ref(), vsize, self.min_tx_fee)?;
            let required = context
                .target
                .checked_add(fee)
                .context("Amount to send overflows")?;

            if input_sum >= required {
                break (input_sum, fee);
            }

            if context.selected < context.candidates.len() {
                context.selected += 1;
                self.derive_missing_keys(context, request.account)?;
                continue;
            }

            bail!(Error::InsufficientFunds(format!(
                "Balance of {} does not cover {} plus a fee of {}",
                input_sum, context.target, fee
            )))
        };

        let leftover = input_sum - context.target - fee;
        if leftover >= change_script.minimal_non_dust() {
            context.change = Some(TxOut {
                value: leftover,
                script_pubkey: change_script,
            });
            context.fee = fee;
        } else {
            tracing::debug!(%leftover, "Change is dust, adding it to the fee");
            context.fee = fee + leftover;
        }

        Ok(())
    }

    fn sign(&self, context: &BuildContext) -> Result<(Transaction, Vec<TxOut>)> {
        let prevouts = context
            .inputs()
            .iter()
            .map(|input| {
                let script_pubkey = context
                    .scripts
                    .get(&input.address_id)
                    .cloned()
                    .with_context(|| format!("No script for address {}", input.address_id))?;

                Ok(TxOut {
                    value: input.amount(),
                    script_pubkey,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut outputs = context.outputs.clone();
        outputs.extend(context.change.clone());

        let mut transaction = unsigned_transaction(
            context.inputs().iter().map(SpendableOutput::outpoint),
            outputs,
        );
        self.ledger.keys().sign(&mut transaction, &prevouts, &context.keys)?;

        Ok((transaction, prevouts))
    }
}

fn add_recipients(context: &mut BuildContext, request: &BuildRequest) -> Result<()> {
    if request.recipients.is_empty() && request.op_return.is_none() {
        bail!(Error::InvalidRecipient("No recipients specified".to_owned()))
    }

    for recipient in &request.recipients {
        if recipient.amount == Amount::ZERO {
            bail!(Error::InvalidRecipient("No amount specified".to_owned()))
        }
        if recipient.subtract_fee {
            bail!(Error::Unsupported("subtracting the fee from a recipient"))
        }

        context.target = context
            .target
            .checked_add(recipient.amount)
            .context("Amount to send overflows")?;
        context.outputs.push(TxOut {
            value: recipient.amount,
            script_pubkey: recipient.script_pubkey.clone(),
        });
    }

    Ok(())
}

fn add_op_return(context: &mut BuildContext, request: &BuildRequest) -> Result<()> {
    let Some(data) = &request.op_return else {
        return Ok(());
    };

    let payload = PushBytesBuf::try_from(data.clone()).context("OP_RETURN payload too large")?;
    context.outputs.push(TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new_op_return(payload),
    });

    Ok(())
}

fn unsigned_transaction(inputs: impl Iterator<Item = OutPoint>, output: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output,
    }
}

/// Virtual size of the signed transaction, assuming every input is P2WPKH
/// and a change output is present.
fn estimate_vsize(inputs: usize, outputs: &[TxOut], change_script: &ScriptBuf) -> u64 {
    let mut draft_outputs = outputs.to_vec();
    draft_outputs.push(TxOut {
        value: Amount::ZERO,
        script_pubkey: change_script.clone(),
    });

    let mut draft = unsigned_transaction(std::iter::repeat(OutPoint::null()).take(inputs), draft_outputs);
    for input in &mut draft.input {
        input.witness = Witness::from_slice(&[
            vec![0u8; P2WPKH_SIGNATURE_LENGTH],
            vec![0u8; P2WPKH_PUBLIC_KEY_LENGTH],
        ]);
    }

    draft.vsize() as u64
}

/// Structural checks on a signed transaction. Returns every problem found.
pub fn verify(keys: &KeyChain, transaction: &Transaction, prevouts: &[TxOut], min_fee: Amount) -> Vec<String> {
    let mut errors = Vec::new();

    if transaction.input.is_empty() {
        errors.push("transaction has no inputs".to_owned());
    }
    if transaction.output.is_empty() {
        errors.push("transaction has no outputs".to_owned());
    }

    let mut outpoints = HashSet::new();
    if !transaction
        .input
        .iter()
        .all(|input| outpoints.insert(input.previous_output))
    {
        errors.push("transaction spends the same output twice".to_owned());
    }

    let mut data_outputs = 0;
    for (index, output) in transaction.output.iter().enumerate() {
        if output.script_pubkey.is_op_return() {
            data_outputs += 1;
            if output.script_pubkey.len() > MAX_OP_RETURN_PAYLOAD + 3 {
                errors.push(format!("output {} carries more than {} bytes of data", index, MAX_OP_RETURN_PAYLOAD));
            }
        } else if output.value < output.script_pubkey.minimal_non_dust() {
            errors.push(format!("output {} is dust", index));
        }
    }
    if data_outputs > 1 {
        errors.push("transaction has more than one OP_RETURN output".to_owned());
    }

    let input_sum = prevouts.iter().try_fold(Amount::ZERO, |sum, prevout| sum.checked_add(prevout.value));
    let output_sum = transaction
        .output
        .iter()
        .try_fold(Amount::ZERO, |sum, output| sum.checked_add(output.value));
    match (input_sum, output_sum) {
        (Some(input_sum), Some(output_sum)) if input_sum < output_sum => {
            errors.push(format!("outputs of {} exceed inputs of {}", output_sum, input_sum))
        }
        (Some(input_sum), Some(output_sum)) if input_sum - output_sum < min_fee => errors.push(format!(
            "fee of {} is below the minimum of {}",
            input_sum - output_sum,
            min_fee
        )),
        (Some(_), Some(_)) => {}
        _ => errors.push("amounts overflow".to_owned()),
    }

    if prevouts.len() == transaction.input.len() {
        for (index, prevout) in prevouts.iter().enumerate() {
            if let Err(error) = keys.verify_input(transaction, index, prevout) {
                errors.push(format!("input {}: {:#}", index, error));
            }
        }
    } else {
        errors.push("previous outputs do not match the inputs".to_owned());
    }

    errors
}
